//! MQTT Packet Decoder
//!
//! Incremental: `decode` is handed whatever has been read so far and
//! reports how many bytes the first complete packet used.

use bytes::Bytes;

use super::{read_variable_int, Reader, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, Publish,
    QoS, ReasonCode,
};

/// MQTT Packet Decoder
pub struct Decoder {
    max_packet_size: usize,
    /// Unknown until a CONNECT is decoded or the owner sets it
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode the first packet in `buf`
    ///
    /// Returns `Ok(None)` until a complete packet is buffered.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some((&first_byte, rest)) = buf.split_first() else {
            return Ok(None);
        };
        let (remaining_length, len_bytes) = match read_variable_int(rest) {
            Ok(header) => header,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let remaining_length = remaining_length as usize;
        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }
        let total_len = 1 + len_bytes + remaining_length;
        let Some(body) = buf.get(1 + len_bytes..total_len) else {
            return Ok(None);
        };

        let flags = first_byte & 0x0F;
        let mut body = Reader::new(body);
        let packet = match first_byte >> 4 {
            1 => self.connect(&mut body)?,
            2 => self.connack(flags, &mut body)?,
            3 => self.publish(flags, &mut body)?,
            12 | 13 if flags != 0 || !body.is_empty() => return Err(DecodeError::InvalidFlags),
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => self.disconnect(flags, &mut body)?,
            t @ (4..=11 | 15) => Packet::Unhandled(t),
            _ => return Err(DecodeError::MalformedPacket("reserved packet type")),
        };

        Ok(Some((packet, total_len)))
    }

    fn connect(&mut self, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if body.string()? != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }
        let protocol_version = ProtocolVersion::try_from(body.u8()?)?;
        self.protocol_version = Some(protocol_version);
        let v5 = protocol_version == ProtocolVersion::V5;

        let flags = body.u8()?;
        if flags & 0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let keep_alive = body.u16()?;
        let properties = if v5 {
            Properties::read(body)?
        } else {
            Properties::default()
        };
        let client_id = body.string()?.to_string();

        // A will is parsed past, never kept
        if flags & 0x04 != 0 {
            if v5 {
                Properties::read(body)?;
            }
            body.string()?;
            body.binary()?;
        }
        let username = match flags & 0x80 {
            0 => None,
            _ => Some(body.string()?.to_string()),
        };
        let password = match flags & 0x40 {
            0 => None,
            _ => Some(Bytes::copy_from_slice(body.binary()?)),
        };

        if !body.is_empty() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start: flags & 0x02 != 0,
            keep_alive,
            username,
            password,
            properties,
        })))
    }

    fn connack(&self, flags: u8, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let ack_flags = body.u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::MalformedPacket("invalid CONNACK flags"));
        }
        let code = body.u8()?;

        let mut connack = ConnAck {
            session_present: ack_flags & 0x01 != 0,
            ..ConnAck::default()
        };
        if self.is_v5() {
            connack.reason_code = ReasonCode::try_from(code)?;
            if !body.is_empty() {
                connack.properties = Properties::read(body)?;
            }
        } else {
            connack.reason_code = ReasonCode::from_v3_connack_code(code);
        }
        Ok(Packet::ConnAck(connack))
    }

    fn publish(&self, flags: u8, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let topic = body.string()?.to_string();
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(body.u16()?),
        };
        let properties = if self.is_v5() {
            Properties::read(body)?
        } else {
            Properties::default()
        };

        Ok(Packet::Publish(Publish {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload: Bytes::copy_from_slice(body.rest()),
            properties,
        }))
    }

    fn disconnect(&self, flags: u8, body: &mut Reader<'_>) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut disconnect = Disconnect::default();
        if !self.is_v5() {
            if !body.is_empty() {
                return Err(DecodeError::MalformedPacket("v3.1.1 DISCONNECT has a body"));
            }
            return Ok(Packet::Disconnect(disconnect));
        }

        if !body.is_empty() {
            disconnect.reason_code = ReasonCode::try_from(body.u8()?)?;
        }
        if !body.is_empty() {
            disconnect.properties = Properties::read(body)?;
        }
        Ok(Packet::Disconnect(disconnect))
    }
}
