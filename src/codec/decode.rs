//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1 and v3.1.1 packets from a byte buffer. The decoder never
//! consumes input on its own; it reports how many bytes a complete packet
//! occupied and leaves buffer management to the caller.

use bytes::Bytes;

use super::{read_variable_int, PacketReader, DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, FixedHeader, Packet, PacketType,
    ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode,
    Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};
use crate::topic::validate_topic_name;

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum packet size, fixed header included
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH + 5);
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete packet,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let header = FixedHeader::from_first_byte(buf[0], remaining_length as usize)?;

        let body_start = 1 + len_bytes;
        let total_len = body_start + header.remaining_length;

        // Reject before waiting for the body
        if total_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge {
                size: total_len,
                max: self.max_packet_size,
            });
        }

        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[body_start..total_len];
        let packet = match header.packet_type {
            PacketType::Connect => decode_connect(body)?,
            PacketType::ConnAck => decode_connack(body)?,
            PacketType::Publish => decode_publish(&header, body)?,
            PacketType::PubAck => Packet::PubAck(PubAck::new(decode_packet_id(body)?)),
            PacketType::PubRec => Packet::PubRec(PubRec::new(decode_packet_id(body)?)),
            PacketType::PubRel => Packet::PubRel(PubRel::new(decode_packet_id(body)?)),
            PacketType::PubComp => Packet::PubComp(PubComp::new(decode_packet_id(body)?)),
            PacketType::Subscribe => decode_subscribe(body)?,
            PacketType::SubAck => decode_suback(body)?,
            PacketType::Unsubscribe => decode_unsubscribe(body)?,
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::new(decode_packet_id(body)?)),
            PacketType::PingReq => decode_empty(body, Packet::PingReq)?,
            PacketType::PingResp => decode_empty(body, Packet::PingResp)?,
            PacketType::Disconnect => decode_empty(body, Packet::Disconnect)?,
        };

        Ok(Some((packet, total_len)))
    }
}

fn decode_connect(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);

    let announced =
        ProtocolVersion::from_name(r.read_string()?).ok_or(DecodeError::InvalidProtocolName)?;
    let level = r.read_u8()?;
    let protocol_version = match ProtocolVersion::from_u8(level) {
        Some(version) if version == announced => version,
        _ => return Err(DecodeError::UnacceptableProtocolVersion(level)),
    };

    let connect_flags = r.read_u8()?;

    // [MQTT-3.1.2-3] reserved bit must be 0
    if protocol_version == ProtocolVersion::V311 && (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    // [MQTT-3.1.2-22]
    if protocol_version == ProtocolVersion::V311 && password_flag && !username_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = r.read_u16()?;
    let client_id = r.read_string()?.to_string();

    let will = if will_flag {
        let topic = r.read_string()?;
        if validate_topic_name(topic).is_err() {
            return Err(DecodeError::InvalidTopic);
        }
        let payload = Bytes::copy_from_slice(r.read_binary()?);
        Some(Will {
            topic: topic.to_string(),
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(r.read_string()?.to_string())
    } else {
        None
    };

    let password = if password_flag {
        Some(Bytes::copy_from_slice(r.read_binary()?))
    } else {
        None
    };

    r.finish()?;

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);
    let ack_flags = r.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(DecodeError::MalformedPacket("reserved CONNACK flags set"));
    }
    let code = r.read_u8()?;
    let return_code = ConnectReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;
    r.finish()?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(header: &FixedHeader, body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);

    let topic = r.read_string()?;
    if validate_topic_name(topic).is_err() {
        return Err(DecodeError::InvalidTopic);
    }

    let packet_id = if header.qos != QoS::AtMostOnce {
        Some(r.read_packet_id()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(r.read_rest());

    Ok(Packet::Publish(Publish {
        dup: header.dup,
        qos: header.qos,
        retain: header.retain,
        topic: topic.into(),
        packet_id,
        payload,
    }))
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK carry only a packet id
fn decode_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    let mut r = PacketReader::new(body);
    let packet_id = r.read_packet_id()?;
    r.finish()?;
    Ok(packet_id)
}

fn decode_subscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);
    let packet_id = r.read_packet_id()?;

    let mut subscriptions = Vec::new();
    while r.remaining() > 0 {
        let filter = r.read_string()?.to_string();
        let options = r.read_u8()?;
        if options & 0xFC != 0 {
            return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
        }
        let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;
        subscriptions.push(Subscription { filter, qos });
    }

    // [MQTT-3.8.3-3]
    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);
    let packet_id = r.read_packet_id()?;

    let mut return_codes = Vec::with_capacity(r.remaining());
    while r.remaining() > 0 {
        let byte = r.read_u8()?;
        let code = SubAckReturnCode::from_byte(byte).ok_or(DecodeError::InvalidReturnCode(byte))?;
        return_codes.push(code);
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = PacketReader::new(body);
    let packet_id = r.read_packet_id()?;

    let mut filters = Vec::new();
    while r.remaining() > 0 {
        filters.push(r.read_string()?.to_string());
    }

    // [MQTT-3.10.3-2]
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without topic filters"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_empty(body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if !body.is_empty() {
        return Err(DecodeError::MalformedPacket("unexpected packet body"));
    }
    Ok(packet)
}
