//! Bluetooth device address

use crate::error::L2capError;
use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address, stored in wire (little-endian) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub bytes: [u8; 6],
}

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for Address {
    type Err = L2capError;

    /// Parses the `AA:BB:CC:DD:EE:FF` form, most significant octet first
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in (0..6).rev() {
            let part = parts
                .next()
                .ok_or_else(|| L2capError::InvalidAddress(s.to_string()))?;
            if part.len() != 2 {
                return Err(L2capError::InvalidAddress(s.to_string()));
            }
            bytes[slot] = u8::from_str_radix(part, 16)
                .map_err(|_| L2capError::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(L2capError::InvalidAddress(s.to_string()));
        }
        Ok(Self { bytes })
    }
}
