//! MQTT v5.0 Properties
//!
//! Only the properties a publishing client reads from CONNACK/DISCONNECT or
//! sends on CONNECT/DISCONNECT are kept as fields. Any other property the
//! server sends is validated and skipped.

use bytes::{BufMut, BytesMut};

use crate::codec::{write_string, write_variable_int, Reader};
use crate::protocol::{DecodeError, EncodeError};

const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
const SERVER_KEEP_ALIVE: u8 = 0x13;
const REASON_STRING: u8 = 0x1F;
const RECEIVE_MAXIMUM: u8 = 0x21;
const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const MAXIMUM_QOS: u8 = 0x24;
const RETAIN_AVAILABLE: u8 = 0x25;
const USER_PROPERTY: u8 = 0x26;
const MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// Wire representation of a property value (MQTT v5.0, table 2-4)
enum PropertyKind {
    Byte,
    TwoByte,
    FourByte,
    VariableInt,
    Utf8String,
    Binary,
    StringPair,
}

fn property_kind(id: u8) -> Option<PropertyKind> {
    match id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => Some(PropertyKind::Byte),
        0x13 | 0x21 | 0x22 | 0x23 => Some(PropertyKind::TwoByte),
        0x02 | 0x11 | 0x18 | 0x27 => Some(PropertyKind::FourByte),
        0x0B => Some(PropertyKind::VariableInt),
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => Some(PropertyKind::Utf8String),
        0x09 | 0x16 => Some(PropertyKind::Binary),
        0x26 => Some(PropertyKind::StringPair),
        _ => None,
    }
}

/// Collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.session_expiry_interval.is_none()
            && self.assigned_client_identifier.is_none()
            && self.server_keep_alive.is_none()
            && self.reason_string.is_none()
            && self.receive_maximum.is_none()
            && self.topic_alias_maximum.is_none()
            && self.maximum_qos.is_none()
            && self.retain_available.is_none()
            && self.user_properties.is_empty()
            && self.maximum_packet_size.is_none()
    }

    /// Decode properties from buffer, including the length prefix.
    /// Returns the properties and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = Reader::new(buf);
        let props = Self::read(&mut reader)?;
        Ok((props, reader.position()))
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = reader.variable_int()?;
        let mut data = reader.sub(len as usize)?;
        let mut props = Properties::new();

        while !data.is_empty() {
            let id = data.variable_int()?;
            let id = u8::try_from(id).map_err(|_| DecodeError::InvalidPropertyId(0xFF))?;

            match property_kind(id).ok_or(DecodeError::InvalidPropertyId(id))? {
                PropertyKind::Byte => {
                    let value = data.u8()?;
                    match id {
                        MAXIMUM_QOS => props.maximum_qos = Some(value),
                        RETAIN_AVAILABLE => props.retain_available = Some(value),
                        _ => {}
                    }
                }
                PropertyKind::TwoByte => {
                    let value = data.u16()?;
                    match id {
                        SERVER_KEEP_ALIVE => props.server_keep_alive = Some(value),
                        RECEIVE_MAXIMUM => props.receive_maximum = Some(value),
                        TOPIC_ALIAS_MAXIMUM => props.topic_alias_maximum = Some(value),
                        _ => {}
                    }
                }
                PropertyKind::FourByte => {
                    let value = data.u32()?;
                    match id {
                        SESSION_EXPIRY_INTERVAL => props.session_expiry_interval = Some(value),
                        MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(value),
                        _ => {}
                    }
                }
                PropertyKind::VariableInt => {
                    data.variable_int()?;
                }
                PropertyKind::Utf8String => {
                    let value = data.string()?.to_string();
                    match id {
                        ASSIGNED_CLIENT_IDENTIFIER => props.assigned_client_identifier = Some(value),
                        REASON_STRING => props.reason_string = Some(value),
                        _ => {}
                    }
                }
                PropertyKind::Binary => {
                    data.binary()?;
                }
                PropertyKind::StringPair => {
                    let key = data.string()?.to_string();
                    let value = data.string()?.to_string();
                    props.user_properties.push((key, value));
                }
            }
        }

        Ok(props)
    }

    /// Encode properties to buffer, including the length prefix
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), EncodeError> {
        let mut buf = BytesMut::new();
        let buf = &mut buf;

        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(ASSIGNED_CLIENT_IDENTIFIER);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(REASON_STRING);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(RECEIVE_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(TOPIC_ALIAS_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(MAXIMUM_QOS);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(RETAIN_AVAILABLE);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(USER_PROPERTY);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }

        write_variable_int(out, buf.len() as u32)?;
        out.put_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_but_valid_properties_are_skipped() {
        // content type (0x03) "json", then assigned client id (0x12) "abc"
        let raw = [
            0x0D, 0x03, 0x00, 0x04, b'j', b's', b'o', b'n', 0x12, 0x00, 0x03, b'a', b'b', b'c',
        ];
        let (props, consumed) = Properties::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(props.assigned_client_identifier.as_deref(), Some("abc"));
    }

    #[test]
    fn test_invalid_property_id_rejected() {
        let raw = [0x02, 0x7F, 0x00];
        assert_eq!(
            Properties::decode(&raw),
            Err(DecodeError::InvalidPropertyId(0x7F))
        );
    }

    #[test]
    fn test_length_prefix_covers_disconnect_properties() {
        let props = Properties {
            reason_string: Some("SIGTERM".to_string()),
            user_properties: vec![("exit-code".to_string(), "143".to_string())],
            ..Default::default()
        };
        assert!(!props.is_empty());

        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        // reason string 1+2+7, user property 1+2+9+2+3
        assert_eq!(buf[0], 27);
        assert_eq!(buf.len(), 28);
        assert_eq!(Properties::decode(&buf).unwrap(), (props, 28));
    }

    #[test]
    fn test_empty_properties_encode_to_zero_length() {
        let mut buf = BytesMut::new();
        Properties::new().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
    }
}
