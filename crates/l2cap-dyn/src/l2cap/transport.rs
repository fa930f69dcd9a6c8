//! ACL transport seam
//!
//! The manager drives the physical link through `Transport`. All methods
//! must return without blocking; outcomes come back through
//! `TransportEvents` (see `manager`).

use super::signaling::SignalingMessage;
use super::types::ChannelId;
use crate::address::Address;

pub trait Transport: Send + Sync + 'static {
    /// Start bringing up an ACL link. Completion is reported with
    /// `TransportEvents::on_connection_complete`.
    fn create_connection(&self, address: Address);

    /// Tear down the ACL link. Reported with `TransportEvents::on_disconnected`.
    fn disconnect(&self, address: Address);

    /// Send a command on the link's signaling channel
    fn send_signal(&self, address: Address, message: SignalingMessage);

    /// Send one payload on a dynamic channel, addressed by the peer's CID
    fn send_data(&self, address: Address, remote_cid: ChannelId, payload: Vec<u8>);
}
