//! Packets a publishing client sends or receives
//!
//! Broker-only packets (SUBSCRIBE, PUBREC, ...) are never built; when one
//! arrives it decodes to [`Packet::Unhandled`].

use bytes::Bytes;

use super::{Properties, ProtocolVersion, QoS, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    /// Any other valid control packet type, by its type nibble
    Unhandled(u8),
}

impl Packet {
    /// Control packet type (upper nibble of the fixed header) and its name
    fn kind(&self) -> (u8, &'static str) {
        match self {
            Packet::Connect(_) => (1, "CONNECT"),
            Packet::ConnAck(_) => (2, "CONNACK"),
            Packet::Publish(_) => (3, "PUBLISH"),
            Packet::PingReq => (12, "PINGREQ"),
            Packet::PingResp => (13, "PINGRESP"),
            Packet::Disconnect(_) => (14, "DISCONNECT"),
            Packet::Unhandled(t @ 4) => (*t, "PUBACK"),
            Packet::Unhandled(t @ 9) => (*t, "SUBACK"),
            Packet::Unhandled(t @ 11) => (*t, "UNSUBACK"),
            Packet::Unhandled(t @ 15) => (*t, "AUTH"),
            Packet::Unhandled(t) => (*t, "unhandled"),
        }
    }

    pub fn packet_type(&self) -> u8 {
        self.kind().0
    }

    /// Upper-case packet name for log lines
    pub fn name(&self) -> &'static str {
        self.kind().1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Also selects v3.1.1 or v5.0 encoding of this packet
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    /// Clean session in v3.1.1
    pub clean_start: bool,
    /// Seconds, 0 disables keep-alive
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl Default for Connect {
    fn default() -> Self {
        Connect {
            protocol_version: ProtocolVersion::V5,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            properties: Properties::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    /// v3.1.1 return codes are mapped onto their v5.0 equivalents
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present only above QoS 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Publish {
    /// A fire-and-forget publication
    pub fn at_most_once(topic: impl Into<String>, payload: Bytes) -> Self {
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload,
            properties: Properties::new(),
        }
    }
}

/// DISCONNECT; reason and properties only go on the wire for v5.0
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}
