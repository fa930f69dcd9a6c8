//! L2CAP Signaling commands exchanged for dynamic channels
//!
//! This module covers the commands the dynamic channel manager sends and
//! answers on the BR/EDR signaling channel: connection, configuration and
//! disconnection requests/responses, plus command reject.

use super::constants::*;
use super::psm::Psm;
use super::types::*;
use crate::error::{L2capError, L2capResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: Psm,
        source_cid: ChannelId,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: ConnectionResult,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: ChannelId,
        flags: ConfigFlags,
        options: ConfigOptions,
    },

    /// Configuration Response
    ///
    /// `source_cid` names the channel endpoint on the device receiving the response.
    ConfigureResponse {
        identifier: SignalId,
        source_cid: ChannelId,
        flags: ConfigFlags,
        result: ConfigureResult,
        options: ConfigOptions,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. } => *identifier,
        }
    }

    /// Parse configuration options from raw bytes
    fn parse_config_options(data: &[u8]) -> L2capResult<ConfigOptions> {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(L2capError::MalformedSignal("truncated option header".into()));
            }
            let raw_type = data[offset];
            let option_type = raw_type & !L2CAP_CONF_HINT;
            let option_length = data[offset + 1] as usize;

            if offset + 2 + option_length > data.len() {
                return Err(L2capError::MalformedSignal(format!(
                    "option 0x{:02X} overruns command",
                    option_type
                )));
            }

            let mut cursor = Cursor::new(&data[offset + 2..offset + 2 + option_length]);

            match option_type {
                L2CAP_CONF_MTU if option_length == 2 => {
                    options.mtu = Some(read_u16(&mut cursor, "MTU")?);
                }
                L2CAP_CONF_FLUSH_TIMEOUT if option_length == 2 => {
                    options.flush_timeout = Some(read_u16(&mut cursor, "flush timeout")?);
                }
                L2CAP_CONF_MTU | L2CAP_CONF_FLUSH_TIMEOUT => {
                    return Err(L2capError::MalformedSignal(format!(
                        "option 0x{:02X} has length {}",
                        option_type, option_length
                    )));
                }
                _ => {
                    if raw_type & L2CAP_CONF_HINT == 0 {
                        options.unknown.push(option_type);
                    }
                }
            }

            offset += 2 + option_length;
        }

        Ok(options)
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(options: &ConfigOptions, out: &mut Vec<u8>) {
        if let Some(mtu) = options.mtu {
            out.push(L2CAP_CONF_MTU);
            out.push(2);
            out.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            out.push(L2CAP_CONF_FLUSH_TIMEOUT);
            out.push(2);
            out.extend_from_slice(&timeout.to_le_bytes());
        }

        // Echoed back in an unknown-options response, no payload
        for option_type in &options.unknown {
            out.push(*option_type);
            out.push(0);
        }
    }

    /// Parse a signaling message from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return Err(L2capError::MalformedSignal("command header too short".into()));
        }

        let mut cursor = Cursor::new(data);
        let code = read_u8(&mut cursor, "code")?;
        let identifier = read_u8(&mut cursor, "identifier")?;
        let length = read_u16(&mut cursor, "length")? as usize;

        let params = &data[L2CAP_COMMAND_HEADER_SIZE..];
        if params.len() < length {
            return Err(L2capError::MalformedSignal(format!(
                "command 0x{:02X} declares {} bytes, {} present",
                code,
                length,
                params.len()
            )));
        }
        let params = &params[..length];
        let mut cursor = Cursor::new(params);

        match code {
            L2CAP_COMMAND_REJECT => {
                let reason = read_u16(&mut cursor, "reject reason")?;
                Ok(Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                })
            }

            L2CAP_CONNECTION_REQUEST => {
                let psm = Psm::new(read_u16(&mut cursor, "PSM")?);
                let source_cid = read_u16(&mut cursor, "source CID")?;
                Ok(Self::ConnectionRequest {
                    identifier,
                    psm,
                    source_cid,
                })
            }

            L2CAP_CONNECTION_RESPONSE => {
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let source_cid = read_u16(&mut cursor, "source CID")?;
                let result = ConnectionResult::from_code(read_u16(&mut cursor, "result")?);
                let status = read_u16(&mut cursor, "status")?;
                Ok(Self::ConnectionResponse {
                    identifier,
                    destination_cid,
                    source_cid,
                    result,
                    status,
                })
            }

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let flags = ConfigFlags::from_bits_truncate(read_u16(&mut cursor, "flags")?);
                let options = Self::parse_config_options(&params[4..])?;
                Ok(Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    options,
                })
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = read_u16(&mut cursor, "source CID")?;
                let flags = ConfigFlags::from_bits_truncate(read_u16(&mut cursor, "flags")?);
                let result = ConfigureResult::from_code(read_u16(&mut cursor, "result")?);
                let options = Self::parse_config_options(&params[6..])?;
                Ok(Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    options,
                })
            }

            L2CAP_DISCONNECTION_REQUEST | L2CAP_DISCONNECTION_RESPONSE => {
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let source_cid = read_u16(&mut cursor, "source CID")?;
                if code == L2CAP_DISCONNECTION_REQUEST {
                    Ok(Self::DisconnectionRequest {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                } else {
                    Ok(Self::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                }
            }

            other => Err(L2capError::UnknownCommand(other)),
        }
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(8);

        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::ConnectionRequest { psm, source_cid, .. } => {
                params.extend_from_slice(&psm.value().to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_code().to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
            }

            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.bits().to_le_bytes());
                Self::serialize_config_options(options, &mut params);
            }

            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.bits().to_le_bytes());
                params.extend_from_slice(&result.to_code().to_le_bytes());
                Self::serialize_config_options(options, &mut params);
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }
        }

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.push(self.command_code());
        result.push(self.identifier());
        // Writing into a Vec cannot fail
        let _ = result.write_u16::<LittleEndian>(params.len() as u16);
        result.extend_from_slice(&params);

        result
    }
}

/// Identifier and local channel a malformed command was aimed at.
///
/// Only commands that name a channel on the receiving side yield a CID;
/// used to close just the offending channel when parsing fails.
pub fn malformed_target(data: &[u8]) -> Option<(SignalId, Option<ChannelId>)> {
    if data.len() < 2 {
        return None;
    }
    let identifier = data[1];
    let params = data.get(L2CAP_COMMAND_HEADER_SIZE..).unwrap_or(&[]);
    let cid_at = |offset: usize| {
        params
            .get(offset..offset + 2)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
    };

    let cid = match data[0] {
        // Destination CID comes first in these
        L2CAP_CONFIGURE_REQUEST | L2CAP_DISCONNECTION_REQUEST => cid_at(0),
        // Source CID names the receiver's endpoint
        L2CAP_CONFIGURE_RESPONSE => cid_at(0),
        L2CAP_CONNECTION_RESPONSE | L2CAP_DISCONNECTION_RESPONSE => cid_at(2),
        _ => None,
    };
    Some((identifier, cid))
}

fn read_u8(cursor: &mut Cursor<&[u8]>, field: &str) -> L2capResult<u8> {
    cursor
        .read_u8()
        .map_err(|_| L2capError::MalformedSignal(format!("missing {}", field)))
}

fn read_u16(cursor: &mut Cursor<&[u8]>, field: &str) -> L2capResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::MalformedSignal(format!("missing {}", field)))
}
