//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel identifier within a link
pub type ChannelId = u16;

/// Identifier correlating a signaling request with its response
pub type SignalId = u8;

/// Security a service requires before a channel to it may open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security requirement; the security gate is not consulted
    #[default]
    None,
    /// Link must be authenticated
    Authentication,
    /// Link must be authenticated and encrypted
    AuthenticatedEncrypted,
    /// Upper layer must authorize the connection
    Authorization,
}

impl SecurityPolicy {
    /// Whether establishing a channel under this policy needs a security check
    pub fn requires_check(&self) -> bool {
        !matches!(self, SecurityPolicy::None)
    }

    /// Pending status reported to the peer while the check runs
    pub(crate) fn pending_status(&self) -> u16 {
        match self {
            SecurityPolicy::None => L2CAP_CONN_STATUS_NO_INFO,
            SecurityPolicy::Authorization => L2CAP_CONN_STATUS_AUTHORIZATION_PENDING,
            _ => L2CAP_CONN_STATUS_AUTHENTICATION_PENDING,
        }
    }
}

/// Dynamic channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Connection request sent or received
    WaitConnect,
    /// Waiting for the peer's connection response
    WaitConnectRsp,
    /// Waiting for the security gate
    SecurityPending,
    /// Exchanging configuration requests/responses
    Config,
    /// Channel is open and ready for data transfer
    Open,
    /// Waiting for disconnection response
    WaitDisconnect,
    /// Channel is closed
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitConnect => write!(f, "Waiting for connection"),
            Self::WaitConnectRsp => write!(f, "Waiting for connection response"),
            Self::SecurityPending => write!(f, "Waiting for security"),
            Self::Config => write!(f, "Configuring"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// ACL link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Which side initiated a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

bitflags! {
    /// Flags field of configuration requests and responses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigFlags: u16 {
        /// More options follow in another command
        const CONTINUATION = 0x0001;
    }
}

/// L2CAP Configuration Options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Option types that were not understood and not marked as hints
    pub unknown: Vec<u8>,
}

impl ConfigOptions {
    pub fn with_mtu(mtu: u16) -> Self {
        Self {
            mtu: Some(mtu),
            ..Default::default()
        }
    }
}

/// Result carried in a connection response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Success,
    Pending,
    PsmNotSupported,
    SecurityBlock,
    NoResources,
    InvalidSourceCid,
    SourceCidInUse,
    Other(u16),
}

impl ConnectionResult {
    pub fn to_code(self) -> u16 {
        match self {
            Self::Success => L2CAP_CONN_SUCCESS,
            Self::Pending => L2CAP_CONN_PENDING,
            Self::PsmNotSupported => L2CAP_CONN_PSM_NOT_SUPPORTED,
            Self::SecurityBlock => L2CAP_CONN_SECURITY_BLOCK,
            Self::NoResources => L2CAP_CONN_NO_RESOURCES,
            Self::InvalidSourceCid => L2CAP_CONN_INVALID_SCID,
            Self::SourceCidInUse => L2CAP_CONN_SCID_IN_USE,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            L2CAP_CONN_SUCCESS => Self::Success,
            L2CAP_CONN_PENDING => Self::Pending,
            L2CAP_CONN_PSM_NOT_SUPPORTED => Self::PsmNotSupported,
            L2CAP_CONN_SECURITY_BLOCK => Self::SecurityBlock,
            L2CAP_CONN_NO_RESOURCES => Self::NoResources,
            L2CAP_CONN_INVALID_SCID => Self::InvalidSourceCid,
            L2CAP_CONN_SCID_IN_USE => Self::SourceCidInUse,
            other => Self::Other(other),
        }
    }
}

/// Result carried in a configuration response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureResult {
    Success,
    UnacceptableParameters,
    Rejected,
    UnknownOptions,
    Pending,
    FlowSpecRejected,
    Other(u16),
}

impl ConfigureResult {
    pub fn to_code(self) -> u16 {
        match self {
            Self::Success => L2CAP_CONF_SUCCESS,
            Self::UnacceptableParameters => L2CAP_CONF_UNACCEPTABLE_PARAMS,
            Self::Rejected => L2CAP_CONF_REJECTED,
            Self::UnknownOptions => L2CAP_CONF_UNKNOWN_OPTIONS,
            Self::Pending => L2CAP_CONF_PENDING,
            Self::FlowSpecRejected => L2CAP_CONF_FLOW_SPEC_REJECTED,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            L2CAP_CONF_SUCCESS => Self::Success,
            L2CAP_CONF_UNACCEPTABLE_PARAMS => Self::UnacceptableParameters,
            L2CAP_CONF_REJECTED => Self::Rejected,
            L2CAP_CONF_UNKNOWN_OPTIONS => Self::UnknownOptions,
            L2CAP_CONF_PENDING => Self::Pending,
            L2CAP_CONF_FLOW_SPEC_REJECTED => Self::FlowSpecRejected,
            other => Self::Other(other),
        }
    }
}
