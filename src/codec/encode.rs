//! MQTT Packet Encoder
//!
//! Each packet body is written to a scratch buffer first, so the fixed
//! header always carries the exact remaining length.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, Publish, QoS,
    ReasonCode,
};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const FLAG_CLEAN_START: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Append the wire form of `packet` to `buf`
    ///
    /// Nothing is written when encoding fails.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let first_byte = match packet {
            Packet::Connect(p) => {
                self.connect_body(p, &mut body)?;
                CONNECT
            }
            Packet::ConnAck(p) => {
                self.connack_body(p, &mut body)?;
                CONNACK
            }
            Packet::Publish(p) => self.publish_body(p, &mut body)?,
            Packet::PingReq => PINGREQ,
            Packet::PingResp => PINGRESP,
            Packet::Disconnect(p) => {
                self.disconnect_body(p, &mut body)?;
                DISCONNECT
            }
            Packet::Unhandled(t) => return Err(EncodeError::UnsupportedPacket(*t)),
        };

        let mut header = BytesMut::with_capacity(5);
        header.put_u8(first_byte);
        write_variable_int(&mut header, body.len() as u32)?;

        buf.reserve(header.len() + body.len());
        buf.put_slice(&header);
        buf.put_slice(&body);
        Ok(())
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    fn connect_body(&self, packet: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, "MQTT")?;
        body.put_u8(packet.protocol_version as u8);

        let flags = [
            (packet.clean_start, FLAG_CLEAN_START),
            (packet.password.is_some(), FLAG_PASSWORD),
            (packet.username.is_some(), FLAG_USERNAME),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0u8, |acc, (_, bit)| acc | bit);
        body.put_u8(flags);
        body.put_u16(packet.keep_alive);

        // The CONNECT's own level decides, the encoder may not know it yet
        if packet.protocol_version == ProtocolVersion::V5 {
            packet.properties.encode(body)?;
        }

        write_string(body, &packet.client_id)?;
        if let Some(username) = &packet.username {
            write_string(body, username)?;
        }
        if let Some(password) = &packet.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn connack_body(&self, packet: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(u8::from(packet.session_present));
        if self.is_v5() {
            body.put_u8(packet.reason_code as u8);
            packet.properties.encode(body)?;
        } else {
            body.put_u8(packet.reason_code.to_v3_connack_code());
        }
        Ok(())
    }

    /// Returns the first header byte, which carries the PUBLISH flags
    fn publish_body(&self, packet: &Publish, body: &mut BytesMut) -> Result<u8, EncodeError> {
        if packet.topic.is_empty() || packet.topic.contains(['+', '#', '\0']) {
            return Err(EncodeError::InvalidTopicName);
        }

        write_string(body, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            body.put_u16(packet.packet_id.unwrap_or(0));
        }
        if self.is_v5() {
            packet.properties.encode(body)?;
        }
        body.put_slice(&packet.payload);

        let mut first_byte = PUBLISH | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }
        Ok(first_byte)
    }

    fn disconnect_body(
        &self,
        packet: &Disconnect,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        // v3.1.1 DISCONNECT and a plain v5.0 normal disconnection carry no body
        if !self.is_v5()
            || (packet.reason_code == ReasonCode::Success && packet.properties.is_empty())
        {
            return Ok(());
        }
        body.put_u8(packet.reason_code as u8);
        packet.properties.encode(body)
    }
}
