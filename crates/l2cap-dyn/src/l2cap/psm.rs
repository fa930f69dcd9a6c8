//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages PSM values for L2CAP connections.

use super::constants::L2CAP_PSM_DYNAMIC_MIN;
use std::fmt;

/// Protocol/Service Multiplexer (PSM) value used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2.
/// And assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/logical-link-control/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Psm(u16);

impl Psm {
    /// Service Discovery Protocol
    pub const SDP: Psm = Psm(0x0001);
    /// RFCOMM protocol
    pub const RFCOMM: Psm = Psm(0x0003);
    /// Telephony Control Protocol
    pub const TCS_BIN: Psm = Psm(0x0005);
    /// BNEP protocol
    pub const BNEP: Psm = Psm(0x000F);
    /// HID Control
    pub const HID_CONTROL: Psm = Psm(0x0011);
    /// HID Interrupt
    pub const HID_INTERRUPT: Psm = Psm(0x0013);
    /// AVCTP protocol
    pub const AVCTP: Psm = Psm(0x0017);
    /// AVDTP protocol
    pub const AVDTP: Psm = Psm(0x0019);
    /// AVCTP Browsing
    pub const AVCTP_BROWSING: Psm = Psm(0x001B);
    /// ATT protocol
    pub const ATT: Psm = Psm(0x001F);

    pub const fn new(value: u16) -> Self {
        Psm(value)
    }

    /// Get the PSM value as u16
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Check the PSM structure rule.
    ///
    /// The least significant octet must be odd and the least significant
    /// bit of the most significant octet must be clear.
    pub const fn is_well_formed(&self) -> bool {
        self.0 & 0x0101 == 0x0001
    }

    /// Check if the PSM lies in the dynamically-assignable range
    pub const fn is_dynamic(&self) -> bool {
        self.0 >= L2CAP_PSM_DYNAMIC_MIN
    }

    /// Check if the PSM may be used for a dynamic channel
    pub const fn is_valid(&self) -> bool {
        self.is_well_formed() && self.is_dynamic()
    }

    fn name(&self) -> Option<&'static str> {
        match *self {
            Psm::SDP => Some("SDP"),
            Psm::RFCOMM => Some("RFCOMM"),
            Psm::TCS_BIN => Some("TCS-BIN"),
            Psm::BNEP => Some("BNEP"),
            Psm::HID_CONTROL => Some("HID-Control"),
            Psm::HID_INTERRUPT => Some("HID-Interrupt"),
            Psm::AVCTP => Some("AVCTP"),
            Psm::AVDTP => Some("AVDTP"),
            Psm::AVCTP_BROWSING => Some("AVCTP-Browsing"),
            Psm::ATT => Some("ATT"),
            _ => None,
        }
    }
}

impl From<u16> for Psm {
    fn from(value: u16) -> Self {
        Psm(value)
    }
}

impl From<Psm> for u16 {
    fn from(psm: Psm) -> Self {
        psm.0
    }
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:04X})", name, self.0),
            None => write!(f, "0x{:04X}", self.0),
        }
    }
}
