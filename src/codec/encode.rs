//! MQTT Packet Encoder
//!
//! Deterministic encoding of MQTT v3.1 / v3.1.1 packets. For every packet the
//! decoder accepts, `decode(encode(p)) == p`.

use bytes::{BufMut, Bytes, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, EncodeError, FixedHeader, Packet, PacketType, Publish, QoS, SubAck,
    Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => encode_packet_id(PacketType::PubAck, p.packet_id, buf),
            Packet::PubRec(p) => encode_packet_id(PacketType::PubRec, p.packet_id, buf),
            Packet::PubRel(p) => encode_packet_id(PacketType::PubRel, p.packet_id, buf),
            Packet::PubComp(p) => encode_packet_id(PacketType::PubComp, p.packet_id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_packet_id(PacketType::UnsubAck, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0); // DISCONNECT type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
        }
    }

    /// Encode into a fresh immutable buffer
    pub fn encode_to_bytes(&self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(32 + packet.client_id.len());

        write_string(&mut body, packet.protocol_version.protocol_name())?;
        body.put_u8(packet.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        body.put_u8(connect_flags);
        body.put_u16(packet.keep_alive);

        write_string(&mut body, &packet.client_id)?;
        if let Some(ref will) = packet.will {
            write_string(&mut body, &will.topic)?;
            write_binary(&mut body, &will.payload)?;
        }
        if let Some(ref username) = packet.username {
            write_string(&mut body, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(&mut body, password)?;
        }

        write_frame(0x10, &body, buf)
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20); // CONNACK type + flags
        buf.put_u8(0x02); // Remaining length
        buf.put_u8(packet.session_present as u8);
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let packet_id = match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(EncodeError::MissingPacketId),
        };

        let topic_len = packet.topic.len();
        if topic_len > u16::MAX as usize {
            return Err(EncodeError::StringTooLong);
        }

        let remaining_length =
            2 + topic_len + packet_id.map_or(0, |_| 2) + packet.payload.len();
        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        let header = FixedHeader {
            packet_type: PacketType::Publish,
            dup: packet.dup && packet.qos != QoS::AtMostOnce,
            qos: packet.qos,
            retain: packet.retain,
            remaining_length,
        };

        buf.reserve(1 + variable_int_len(remaining_length as u32) + remaining_length);
        buf.put_u8(header.first_byte());
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;
        if let Some(id) = packet_id {
            buf.put_u16(id);
        }
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(2 + packet.subscriptions.len() * 16);
        body.put_u16(packet.packet_id);
        for sub in &packet.subscriptions {
            write_string(&mut body, &sub.filter)?;
            body.put_u8(sub.qos as u8);
        }
        write_frame(0x82, &body, buf)
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(2 + packet.return_codes.len());
        body.put_u16(packet.packet_id);
        for code in &packet.return_codes {
            body.put_u8(code.to_byte());
        }
        write_frame(0x90, &body, buf)
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(2 + packet.filters.len() * 16);
        body.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(&mut body, filter)?;
        }
        write_frame(0xA2, &body, buf)
    }
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK
fn encode_packet_id(
    packet_type: PacketType,
    packet_id: u16,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let header = FixedHeader {
        packet_type,
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        remaining_length: 2,
    };
    buf.put_u8(header.first_byte());
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn write_frame(first_byte: u8, body: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    buf.reserve(1 + variable_int_len(body.len() as u32) + body.len());
    buf.put_u8(first_byte);
    write_variable_int(buf, body.len() as u32)?;
    buf.put_slice(body);
    Ok(())
}
