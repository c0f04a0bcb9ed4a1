//! MQTT Codec Tests
//!
//! Encoding and decoding for every MQTT v3.1 / v3.1.1 packet type, plus the
//! malformed-input cases the decoder must reject.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

// ============================================================================
// Helpers
// ============================================================================

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len(), "decoder left bytes unconsumed");
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn canonical_packets() -> Vec<Packet> {
    vec![
        Packet::Connect(Box::new(Connect::default())),
        Packet::Connect(Box::new(Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: "sensor-42".to_string(),
            clean_session: false,
            keep_alive: 300,
            username: Some("user".to_string()),
            password: Some(Bytes::from_static(b"secret")),
            will: Some(Will {
                topic: "status/sensor-42".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        })),
        Packet::Connect(Box::new(Connect {
            protocol_version: ProtocolVersion::V31,
            client_id: "legacy".to_string(),
            ..Connect::default()
        })),
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)),
        Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        }),
        Packet::ConnAck(ConnAck::new(ConnectReturnCode::BadUserNameOrPassword)),
        Packet::Publish(Publish {
            topic: "a/b".into(),
            payload: Bytes::from_static(b"hello"),
            ..Publish::default()
        }),
        Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "cfg/x".into(),
            packet_id: Some(65535),
            payload: Bytes::new(),
        }),
        Packet::PubAck(PubAck::new(1)),
        Packet::PubRec(PubRec::new(2)),
        Packet::PubRel(PubRel::new(3)),
        Packet::PubComp(PubComp::new(4)),
        Packet::Subscribe(Subscribe {
            packet_id: 10,
            subscriptions: vec![
                Subscription {
                    filter: "t/+".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                Subscription {
                    filter: "#".to_string(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        }),
        Packet::SubAck(SubAck {
            packet_id: 10,
            return_codes: vec![
                SubAckReturnCode::Granted(QoS::AtLeastOnce),
                SubAckReturnCode::Failure,
            ],
        }),
        Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            filters: vec!["t/+".to_string(), "a/#".to_string()],
        }),
        Packet::UnsubAck(UnsubAck::new(11)),
        Packet::PingReq,
        Packet::PingResp,
        Packet::Disconnect,
    ]
}

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_round_trip_every_packet_type() {
    for packet in canonical_packets() {
        let encoded = encode_packet(&packet);
        let decoded = decode_packet(&encoded).unwrap();
        assert_eq!(packet, decoded, "round trip failed for {:?}", packet);
    }
}

#[test]
fn test_encode_is_deterministic() {
    for packet in canonical_packets() {
        assert_eq!(encode_packet(&packet), encode_packet(&packet));
    }
}

// ============================================================================
// Byte-exact encodings
// ============================================================================

#[test]
fn test_connect_v311_bytes() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "c".to_string(),
        keep_alive: 10,
        ..Connect::default()
    }));
    let expected: &[u8] = &[
        0x10, 13, // fixed header
        0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
        0x04, // level
        0x02, // clean session
        0x00, 0x0A, // keep alive
        0x00, 0x01, b'c', // client id
    ];
    assert_eq!(&encode_packet(&packet)[..], expected);
}

#[test]
fn test_connect_v31_uses_mqisdp() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V31,
        client_id: "c".to_string(),
        ..Connect::default()
    }));
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[2..10], &[0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p']);
    assert_eq!(encoded[10], 3);
}

#[test_case(Packet::PubAck(PubAck::new(0x1234)), &[0x40, 0x02, 0x12, 0x34] ; "puback")]
#[test_case(Packet::PubRec(PubRec::new(0x1234)), &[0x50, 0x02, 0x12, 0x34] ; "pubrec")]
#[test_case(Packet::PubRel(PubRel::new(0x1234)), &[0x62, 0x02, 0x12, 0x34] ; "pubrel")]
#[test_case(Packet::PubComp(PubComp::new(0x1234)), &[0x70, 0x02, 0x12, 0x34] ; "pubcomp")]
#[test_case(Packet::UnsubAck(UnsubAck::new(7)), &[0xB0, 0x02, 0x00, 0x07] ; "unsuback")]
#[test_case(Packet::PingReq, &[0xC0, 0x00] ; "pingreq")]
#[test_case(Packet::PingResp, &[0xD0, 0x00] ; "pingresp")]
#[test_case(Packet::Disconnect, &[0xE0, 0x00] ; "disconnect")]
#[test_case(Packet::ConnAck(ConnAck::new(ConnectReturnCode::IdentifierRejected)), &[0x20, 0x02, 0x00, 0x02] ; "connack rejected")]
fn test_fixed_size_bytes(packet: Packet, expected: &[u8]) {
    assert_eq!(&encode_packet(&packet)[..], expected);
}

#[test]
fn test_publish_qos1_bytes() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "a/b".into(),
        packet_id: Some(10),
        payload: Bytes::from_static(b"hi"),
        ..Publish::default()
    });
    let expected: &[u8] = &[
        0x33, 9, // PUBLISH qos1 retain
        0x00, 0x03, b'a', b'/', b'b', // topic
        0x00, 0x0A, // packet id
        b'h', b'i',
    ];
    assert_eq!(&encode_packet(&packet)[..], expected);
}

#[test]
fn test_suback_failure_code() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 1,
        return_codes: vec![SubAckReturnCode::Failure],
    });
    assert_eq!(&encode_packet(&packet)[..], &[0x90, 0x03, 0x00, 0x01, 0x80]);
}

#[test]
fn test_publish_without_packet_id_fails_to_encode() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "a".into(),
        ..Publish::default()
    });
    let mut buf = BytesMut::new();
    assert!(Encoder::new().encode(&packet, &mut buf).is_err());
}

// ============================================================================
// Streaming behaviour
// ============================================================================

#[test]
fn test_partial_packet_needs_more_data() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "stream/test".into(),
        packet_id: Some(5),
        payload: Bytes::from(vec![7u8; 200]),
        ..Publish::default()
    });
    let encoded = encode_packet(&packet);
    let decoder = Decoder::new();

    for cut in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..cut]), Ok(None), "cut at {}", cut);
    }
    let (decoded, consumed) = decoder.decode(&encoded).unwrap().unwrap();
    assert_eq!(decoded, packet);
    assert_eq!(consumed, encoded.len());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingReq);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck::new(9))));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck::new(9)));
}

#[test]
fn test_large_remaining_length_round_trip() {
    let packet = Packet::Publish(Publish {
        topic: "big".into(),
        payload: Bytes::from(vec![0xAB; 20_000]),
        ..Publish::default()
    });
    let encoded = encode_packet(&packet);
    // 20_005 needs a 3-byte remaining length
    assert_eq!(encoded[1] & 0x80, 0x80);
    assert_eq!(encoded[2] & 0x80, 0x80);
    assert_eq!(encoded[3] & 0x80, 0x00);

    let decoder = Decoder::new().with_max_packet_size(64 * 1024);
    let (decoded, _) = decoder.decode(&encoded).unwrap().unwrap();
    assert_eq!(decoded, packet);
}

// ============================================================================
// Malformed input
// ============================================================================

#[test]
fn test_remaining_length_five_bytes_rejected() {
    let buf = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    assert_eq!(
        Decoder::new().decode(&buf),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn test_oversize_rejected_before_body_arrives() {
    // Header announces 10_000 bytes but only the header is present
    let buf = [0x30, 0x90, 0x4E];
    let result = Decoder::new().decode(&buf);
    assert!(matches!(result, Err(DecodeError::PacketTooLarge { .. })));
}

#[test]
fn test_connect_reserved_flag_rejected() {
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    buf[9] |= 0x01;
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_v31_reserved_flag_ignored() {
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V31,
        client_id: "x".to_string(),
        ..Connect::default()
    })));
    // flags byte sits after 2+6 name bytes and the level byte
    buf[11] |= 0x01;
    assert!(decode_packet(&buf).is_ok());
}

#[test]
fn test_connect_unacceptable_version() {
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    buf[8] = 5;
    assert_eq!(
        decode_packet(&buf),
        Err(DecodeError::UnacceptableProtocolVersion(5))
    );
}

#[test]
fn test_connect_unknown_protocol_name() {
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    buf[4] = b'X';
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidProtocolName));
}

#[test]
fn test_connect_trailing_bytes_rejected() {
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    buf[1] += 1;
    buf.extend_from_slice(&[0x00]);
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_connect_truncated_body_rejected() {
    // Username flag set but no username bytes follow
    let mut buf = encode_packet(&Packet::Connect(Box::new(Connect::default())));
    buf[9] |= 0x80;
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test_case("a/+" ; "single level wildcard")]
#[test_case("a/#" ; "multi level wildcard")]
#[test_case("" ; "empty topic")]
fn test_publish_invalid_topic_rejected(topic: &str) {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0x30, (2 + topic.len()) as u8, 0x00, topic.len() as u8]);
    buf.extend_from_slice(topic.as_bytes());
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidTopic));
}

#[test]
fn test_puback_leftover_rejected() {
    let buf = [0x40, 0x03, 0x00, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_puback_deficit_rejected() {
    let buf = [0x40, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_packet_id_zero_rejected() {
    let buf = [0x40, 0x02, 0x00, 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidPacketId));
}

#[test]
fn test_subscribe_requires_filters() {
    let buf = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_subscribe_invalid_qos() {
    let buf = [0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x03];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_pingreq_with_body_rejected() {
    let buf = [0xC0, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// Property-based tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use crate::codec::{read_variable_int, write_variable_int};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_variable_int_roundtrip(value in 0u32..268_435_455u32) {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            prop_assert_eq!(value, decoded);
            prop_assert_eq!(written, consumed);
        }

        #[test]
        fn prop_publish_roundtrip(
            topic in "[a-z0-9]{1,12}(/[a-z0-9]{1,8}){0,4}",
            qos in 0u8..3,
            retain in any::<bool>(),
            packet_id in 1u16..=65535,
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let qos = QoS::from_u8(qos).unwrap();
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: topic.as_str().into(),
                packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
                payload: Bytes::from(payload),
            });
            let encoded = encode_packet(&packet);
            prop_assert_eq!(decode_packet(&encoded).unwrap(), packet);
        }
    }
}
