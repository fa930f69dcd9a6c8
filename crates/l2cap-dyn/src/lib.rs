//! l2cap-dyn - L2CAP dynamic channel manager for Bluetooth BR/EDR
//!
//! This library opens, accepts and tears down connection-oriented L2CAP
//! channels. It owns the signaling state machines and link bookkeeping;
//! the ACL transport and the security procedures are supplied by the
//! embedding stack through the `Transport` and `SecurityGate` traits.

pub mod address;
pub mod config;
pub mod error;
pub mod handler;
pub mod l2cap;

// Re-export common types for convenience
pub use address::Address;
pub use config::ManagerConfig;
pub use error::{ConnectionFailure, L2capError, L2capResult};
pub use handler::Handler;
pub use l2cap::{
    ChannelHandle, ConfigOptions, ConnectionResult, ConfigureResult, DynamicChannelManager,
    DynamicChannelService, ManagerSnapshot, Psm, SecurityGate, SecurityPolicy, SignalingMessage,
    Transport, TransportEvents,
};
