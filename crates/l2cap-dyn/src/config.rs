//! Dynamic channel manager configuration

use crate::error::{L2capError, L2capResult};
use crate::l2cap::constants::{L2CAP_DEFAULT_MTU, L2CAP_MIN_MTU};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the dynamic channel manager.
///
/// Timeouts are in milliseconds so the struct maps directly onto a JSON or
/// TOML document; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// MTU requested for the incoming direction of every channel
    pub local_mtu: u16,
    /// Smallest MTU accepted from a peer
    pub min_mtu: u16,
    /// Configuration requests re-sent after "unacceptable parameters" before giving up
    pub max_config_retries: u8,
    /// Response timeout (RTX) for every signaling request
    pub response_timeout_ms: u64,
    /// Extended response timeout (ERTX) after the peer answered "pending"
    pub extended_response_timeout_ms: u64,
    /// Time allowed for the security gate to answer
    pub security_timeout_ms: u64,
    /// Time allowed for the ACL link to come up
    pub link_connect_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_mtu: L2CAP_DEFAULT_MTU,
            min_mtu: L2CAP_MIN_MTU,
            max_config_retries: 3,
            response_timeout_ms: 2_000,
            extended_response_timeout_ms: 60_000,
            security_timeout_ms: 30_000,
            link_connect_timeout_ms: 10_000,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn with_local_mtu(mut self, mtu: u16) -> Self {
        self.local_mtu = mtu;
        self
    }

    #[must_use]
    pub fn with_max_config_retries(mut self, retries: u8) -> Self {
        self.max_config_retries = retries;
        self
    }

    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_link_connect_timeout(mut self, timeout: Duration) -> Self {
        self.link_connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn extended_response_timeout(&self) -> Duration {
        Duration::from_millis(self.extended_response_timeout_ms)
    }

    pub fn security_timeout(&self) -> Duration {
        Duration::from_millis(self.security_timeout_ms)
    }

    pub fn link_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.link_connect_timeout_ms)
    }

    /// Check that the values can drive the channel state machines
    pub fn validate(&self) -> L2capResult<()> {
        if self.min_mtu < L2CAP_MIN_MTU {
            return Err(L2capError::InvalidConfig(format!(
                "min_mtu {} below the BR/EDR minimum {}",
                self.min_mtu, L2CAP_MIN_MTU
            )));
        }
        if self.local_mtu < self.min_mtu {
            return Err(L2capError::InvalidConfig(format!(
                "local_mtu {} below min_mtu {}",
                self.local_mtu, self.min_mtu
            )));
        }
        let timeouts = [
            ("response_timeout_ms", self.response_timeout_ms),
            ("extended_response_timeout_ms", self.extended_response_timeout_ms),
            ("security_timeout_ms", self.security_timeout_ms),
            ("link_connect_timeout_ms", self.link_connect_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(L2capError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}
