//! L2CAP dynamic channel management
//!
//! This module implements the connection-oriented channel layer of L2CAP
//! on BR/EDR links:
//! - Registration of services listening on a PSM
//! - Opening channels to remote services, bringing the ACL link up on demand
//! - The connect, security, configuration and disconnect exchanges
//! - Link lifecycle, timeouts and failure reporting

pub mod channel;
pub mod constants;
pub mod link;
pub mod link_manager;
pub mod manager;
pub mod psm;
pub mod security;
pub mod service;
pub mod signaling;
pub mod transport;
pub mod types;

// Re-export the public API
pub use self::channel::{DynamicChannel, OnConnectionFailure, OnConnectionOpen};
pub use self::link::Link;
pub use self::link_manager::LinkManager;
pub use self::manager::{
    ChannelHandle, ChannelSnapshot, DynamicChannelManager, LinkSnapshot, ManagerSnapshot,
    TransportEvents,
};
pub use self::psm::Psm;
pub use self::security::SecurityGate;
pub use self::service::{DynamicChannelService, ServiceEntry, ServiceRegistry};
pub use self::signaling::SignalingMessage;
pub use self::transport::Transport;
pub use self::types::*;
