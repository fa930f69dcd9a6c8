//! Error types for the l2cap-dyn library
//!
//! `L2capError` covers synchronous failures (bad input, malformed frames,
//! a stopped manager). `ConnectionFailure` is the reason handed to a
//! connection's failure callback.

use crate::l2cap::psm::Psm;
use thiserror::Error;

/// Errors that can occur when working with the dynamic channel manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum L2capError {
    #[error("Invalid PSM: {0}")]
    InvalidPsm(Psm),

    #[error("PSM {0} already registered")]
    PsmAlreadyRegistered(Psm),

    #[error("PSM {0} not registered")]
    PsmNotRegistered(Psm),

    #[error("Malformed signaling command: {0}")]
    MalformedSignal(String),

    #[error("Unknown signaling command code 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Payload of {len} bytes exceeds MTU {mtu}")]
    MtuExceeded { len: usize, mtu: u16 },

    #[error("Channel is closed")]
    NotConnected,

    #[error("Dynamic channel manager stopped")]
    ManagerStopped,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Why a requested dynamic channel did not open
///
/// Exactly one of these, or an open channel, is delivered per
/// `connect_channel` request.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum ConnectionFailure {
    #[error("ACL link failed or was lost")]
    LinkFailure,

    #[error("Security requirements not met")]
    SecurityFailure,

    #[error("Channel configuration failed")]
    ConfigurationFailure,

    #[error("Signaling exchange timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Remote device refused or closed the channel")]
    PeerDisconnected,
}
