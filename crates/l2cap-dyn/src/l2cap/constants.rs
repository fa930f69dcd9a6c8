//! L2CAP constants for the BR/EDR signaling channel and dynamic channels
//!
//! See Bluetooth Core Specification Vol 3, Part A.

// Channel identifiers
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;

// PSM ranges
pub const L2CAP_PSM_DYNAMIC_MIN: u16 = 0x1001;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;

/// Size of the signaling command header (code, identifier, length)
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CONN_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONN_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_CONN_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONN_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_CONN_INVALID_SCID: u16 = 0x0006;
pub const L2CAP_CONN_SCID_IN_USE: u16 = 0x0007;

// Connection response status (valid when result is pending)
pub const L2CAP_CONN_STATUS_NO_INFO: u16 = 0x0000;
pub const L2CAP_CONN_STATUS_AUTHENTICATION_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_STATUS_AUTHORIZATION_PENDING: u16 = 0x0002;

// Configuration response results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CONF_REJECTED: u16 = 0x0002;
pub const L2CAP_CONF_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CONF_PENDING: u16 = 0x0004;
pub const L2CAP_CONF_FLOW_SPEC_REJECTED: u16 = 0x0005;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
/// Set on an option type that the receiver may skip when unknown
pub const L2CAP_CONF_HINT: u8 = 0x80;

// MTU values for BR/EDR
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MIN_MTU: u16 = 48;
