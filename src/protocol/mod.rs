//! MQTT Protocol definitions and types
//!
//! Defines the packet model and header types for MQTT v3.1 and v3.1.1.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// MQTT Protocol Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1 (protocol level 3, name "MQIsdp")
    V31 = 3,
    /// MQTT v3.1.1 (protocol level 4, name "MQTT")
    V311 = 4,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            _ => None,
        }
    }

    /// Protocol name carried in the CONNECT variable header
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }

    /// Resolve the version a protocol name announces, ignoring the level byte
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MQIsdp" => Some(ProtocolVersion::V31),
            "MQTT" => Some(ProtocolVersion::V311),
            _ => None,
        }
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (effective delivery QoS)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// Flag nibble mandated for every type except PUBLISH
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// First byte and remaining length of an MQTT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub remaining_length: usize,
}

impl FixedHeader {
    /// Split the first header byte into type and flags.
    ///
    /// Enforces the fixed flag nibble for non-PUBLISH packets and rejects
    /// QoS 3 and DUP on QoS 0 publishes.
    pub fn from_first_byte(byte: u8, remaining_length: usize) -> Result<Self, DecodeError> {
        let type_bits = byte >> 4;
        let flags = byte & 0x0F;
        let packet_type =
            PacketType::from_u8(type_bits).ok_or(DecodeError::InvalidPacketType(type_bits))?;

        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(DecodeError::InvalidFlags);
            }
            return Ok(Self {
                packet_type,
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                remaining_length,
            });
        }

        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let dup = flags & 0x08 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidFlags);
        }

        Ok(Self {
            packet_type,
            dup,
            qos,
            retain: flags & 0x01 != 0,
            remaining_length,
        })
    }

    /// Pack type and flags back into the first header byte
    pub fn first_byte(&self) -> u8 {
        let flags = match self.packet_type.required_flags() {
            Some(required) => required,
            None => ((self.dup as u8) << 3) | ((self.qos as u8) << 1) | self.retain as u8,
        };
        ((self.packet_type as u8) << 4) | flags
    }
}
