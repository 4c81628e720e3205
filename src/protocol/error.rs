//! Codec error types

use std::fmt;

/// Reasons a byte sequence is not a valid packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends inside a field
    InsufficientData,
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    /// CONNECT without the "MQTT" protocol name
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    /// Reserved fixed header flags set
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Larger than the decoder's packet size limit
    PacketTooLarge,
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("truncated field"),
            Self::InvalidRemainingLength => f.write_str("variable byte integer too long"),
            Self::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::InvalidPropertyId(id) => write!(f, "unknown property 0x{:02X}", id),
            Self::InvalidFlags => f.write_str("reserved header flags set"),
            Self::MalformedPacket(what) => write!(f, "malformed packet ({})", what),
            Self::PacketTooLarge => f.write_str("packet exceeds size limit"),
            Self::InvalidReasonCode(r) => write!(f, "unknown reason code 0x{:02X}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reasons a packet cannot be put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length above the protocol maximum
    PacketTooLarge,
    /// String or binary field above 65535 bytes
    StringTooLong,
    /// Empty topic, or one with wildcards or NUL
    InvalidTopicName,
    /// Packet type this codec does not produce
    UnsupportedPacket(u8),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet exceeds maximum remaining length"),
            Self::StringTooLong => f.write_str("field longer than 65535 bytes"),
            Self::InvalidTopicName => f.write_str("topic name is empty or contains wildcards"),
            Self::UnsupportedPacket(t) => write!(f, "cannot encode packet type {}", t),
        }
    }
}

impl std::error::Error for EncodeError {}
