//! Cluster bus frames
//!
//! Every frame is a flat big-endian record: the origin node, an optional
//! packet id, five optional strings, a flags byte, the payload, the peer
//! host and two millisecond timestamps. Absent values are written as a
//! zero length (or zero for the numeric fields).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ClusterError;
use crate::protocol::QoS;

/// What a frame announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClusterKind {
    /// A client bound its identity on the origin node
    Connect = 1,
    /// A subscription was granted on the origin node
    Subscribe = 2,
    /// A subscription was removed on the origin node
    Unsubscribe = 3,
    /// A client published on the origin node
    UpStream = 4,
    /// A server-side publish on the origin node
    DownStream = 5,
}

impl ClusterKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ClusterKind::Connect),
            2 => Some(ClusterKind::Subscribe),
            3 => Some(ClusterKind::Unsubscribe),
            4 => Some(ClusterKind::UpStream),
            5 => Some(ClusterKind::DownStream),
            _ => None,
        }
    }

    /// Name for logging
    pub fn name(self) -> &'static str {
        match self {
            ClusterKind::Connect => "CONNECT",
            ClusterKind::Subscribe => "SUBSCRIBE",
            ClusterKind::Unsubscribe => "UNSUBSCRIBE",
            ClusterKind::UpStream => "UP_STREAM",
            ClusterKind::DownStream => "DOWN_STREAM",
        }
    }
}

/// One event exchanged between nodes
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEvent {
    pub kind: ClusterKind,
    /// Node the event happened on
    pub node: String,
    pub message_id: Option<u16>,
    pub from_client_id: Option<String>,
    pub from_username: Option<String>,
    /// Target identity (CONNECT, SUBSCRIBE, UNSUBSCRIBE, DOWN_STREAM)
    pub client_id: Option<String>,
    pub username: Option<String>,
    /// Topic name or filter
    pub topic: Option<String>,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    pub peer_host: Option<String>,
    /// Milliseconds since the epoch when the frame was built
    pub timestamp: i64,
    /// Milliseconds since the epoch when the PUBLISH reached the origin node
    pub publish_received_at: Option<i64>,
}

impl ClusterEvent {
    /// An event with every optional field empty
    pub fn new(kind: ClusterKind, node: impl Into<String>) -> Self {
        Self {
            kind,
            node: node.into(),
            message_id: None,
            from_client_id: None,
            from_username: None,
            client_id: None,
            username: None,
            topic: None,
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            payload: Bytes::new(),
            peer_host: None,
            timestamp: 0,
            publish_received_at: None,
        }
    }

    /// Serialize into a bus frame
    pub fn encode(&self) -> Result<Bytes, ClusterError> {
        let mut buf = BytesMut::with_capacity(36 + self.payload.len() + self.node.len());

        put_str16(&mut buf, Some(&self.node))?;
        buf.put_u16(self.message_id.unwrap_or(0));
        put_str16(&mut buf, self.from_client_id.as_deref())?;
        put_str16(&mut buf, self.from_username.as_deref())?;
        put_str16(&mut buf, self.client_id.as_deref())?;
        put_str16(&mut buf, self.username.as_deref())?;
        put_str16(&mut buf, self.topic.as_deref())?;

        let mut flags = (self.kind as u8) << 4;
        if self.dup {
            flags |= 0x08;
        }
        flags |= (self.qos as u8) << 1;
        if self.retain {
            flags |= 0x01;
        }
        buf.put_u8(flags);

        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| ClusterError::Malformed("payload too long"))?;
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);

        let peer_host = self.peer_host.as_deref().unwrap_or("");
        let peer_len =
            u8::try_from(peer_host.len()).map_err(|_| ClusterError::Malformed("peer host too long"))?;
        buf.put_u8(peer_len);
        buf.put_slice(peer_host.as_bytes());

        buf.put_i64(self.timestamp);
        buf.put_i64(self.publish_received_at.unwrap_or(0));

        Ok(buf.freeze())
    }

    /// Parse a bus frame
    pub fn decode(mut buf: &[u8]) -> Result<Self, ClusterError> {
        let node = get_str16(&mut buf)?.unwrap_or_default();
        let message_id = match get_u16(&mut buf)? {
            0 => None,
            id => Some(id),
        };
        let from_client_id = get_str16(&mut buf)?;
        let from_username = get_str16(&mut buf)?;
        let client_id = get_str16(&mut buf)?;
        let username = get_str16(&mut buf)?;
        let topic = get_str16(&mut buf)?;

        let flags = get_u8(&mut buf)?;
        let kind =
            ClusterKind::from_u8(flags >> 4).ok_or(ClusterError::Malformed("unknown event kind"))?;
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_u8((flags & 0x06) >> 1).ok_or(ClusterError::Malformed("invalid qos"))?;
        let retain = flags & 0x01 != 0;

        let payload_len = get_u32(&mut buf)? as usize;
        if buf.remaining() < payload_len {
            return Err(ClusterError::Malformed("truncated payload"));
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        let peer_len = get_u8(&mut buf)? as usize;
        let peer_host = get_str(&mut buf, peer_len)?;

        let timestamp = get_i64(&mut buf)?;
        let publish_received_at = match get_i64(&mut buf)? {
            0 => None,
            at => Some(at),
        };

        if buf.has_remaining() {
            return Err(ClusterError::Malformed("trailing bytes"));
        }

        Ok(Self {
            kind,
            node,
            message_id,
            from_client_id,
            from_username,
            client_id,
            username,
            topic,
            dup,
            qos,
            retain,
            payload,
            peer_host,
            timestamp,
            publish_received_at,
        })
    }
}

fn put_str16(buf: &mut BytesMut, s: Option<&str>) -> Result<(), ClusterError> {
    let s = s.unwrap_or("");
    let len = u16::try_from(s.len()).map_err(|_| ClusterError::Malformed("string too long"))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, ClusterError> {
    if buf.remaining() < 1 {
        return Err(ClusterError::Malformed("truncated frame"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, ClusterError> {
    if buf.remaining() < 2 {
        return Err(ClusterError::Malformed("truncated frame"));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, ClusterError> {
    if buf.remaining() < 4 {
        return Err(ClusterError::Malformed("truncated frame"));
    }
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, ClusterError> {
    if buf.remaining() < 8 {
        return Err(ClusterError::Malformed("truncated frame"));
    }
    Ok(buf.get_i64())
}

fn get_str16(buf: &mut &[u8]) -> Result<Option<String>, ClusterError> {
    let len = get_u16(buf)? as usize;
    get_str(buf, len)
}

/// Read `len` bytes of UTF-8; zero length is an absent value
fn get_str(buf: &mut &[u8], len: usize) -> Result<Option<String>, ClusterError> {
    if buf.remaining() < len {
        return Err(ClusterError::Malformed("truncated string"));
    }
    if len == 0 {
        return Ok(None);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| ClusterError::Malformed("invalid utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(Some(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn up_stream() -> ClusterEvent {
        ClusterEvent {
            message_id: Some(42),
            from_client_id: Some("sensor-1".to_string()),
            from_username: Some("alice".to_string()),
            topic: Some("room/1/temp".to_string()),
            qos: QoS::ExactlyOnce,
            retain: true,
            payload: Bytes::from_static(b"21.5"),
            timestamp: 1_700_000_000_123,
            publish_received_at: Some(1_700_000_000_100),
            ..ClusterEvent::new(ClusterKind::UpStream, "node-a")
        }
    }

    #[test]
    fn test_encode_decode_up_stream() {
        let event = up_stream();
        let frame = event.encode().unwrap();
        assert_eq!(ClusterEvent::decode(&frame).unwrap(), event);
    }

    #[test]
    fn test_flags_byte() {
        let frame = up_stream().encode().unwrap();
        // node(2+6) id(2) from(2+8) user(2+5) client(2) username(2) topic(2+11)
        let flags = frame[2 + 6 + 2 + 2 + 8 + 2 + 5 + 2 + 2 + 2 + 11];
        assert_eq!(flags, (4 << 4) | (2 << 1) | 1);
    }

    #[test]
    fn test_absent_fields_decode_as_none() {
        let event = ClusterEvent {
            client_id: Some("c1".to_string()),
            peer_host: Some("10.0.0.7".to_string()),
            timestamp: 5,
            ..ClusterEvent::new(ClusterKind::Connect, "node-b")
        };
        let decoded = ClusterEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, ClusterKind::Connect);
        assert_eq!(decoded.message_id, None);
        assert_eq!(decoded.from_client_id, None);
        assert_eq!(decoded.topic, None);
        assert_eq!(decoded.publish_received_at, None);
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.peer_host.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = up_stream().encode().unwrap();
        for len in [0, 1, 5, frame.len() / 2, frame.len() - 1] {
            assert!(matches!(
                ClusterEvent::decode(&frame[..len]),
                Err(ClusterError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_unknown_kind_and_bad_qos() {
        let mut frame = ClusterEvent::new(ClusterKind::Subscribe, "n").encode().unwrap().to_vec();
        // node(2+1) id(2) five empty strings(10)
        let flags_at = 3 + 2 + 10;

        frame[flags_at] = 9 << 4;
        assert!(matches!(
            ClusterEvent::decode(&frame),
            Err(ClusterError::Malformed("unknown event kind"))
        ));

        frame[flags_at] = (2 << 4) | (3 << 1);
        assert!(matches!(
            ClusterEvent::decode(&frame),
            Err(ClusterError::Malformed("invalid qos"))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut frame = ClusterEvent::new(ClusterKind::Connect, "ab").encode().unwrap().to_vec();
        frame[2] = 0xFF;
        assert!(matches!(
            ClusterEvent::decode(&frame),
            Err(ClusterError::Malformed("invalid utf-8"))
        ));
    }

    #[test]
    fn test_oversized_peer_host_rejected() {
        let event = ClusterEvent {
            peer_host: Some("h".repeat(300)),
            ..ClusterEvent::new(ClusterKind::Connect, "n")
        };
        assert!(event.encode().is_err());
    }
}
