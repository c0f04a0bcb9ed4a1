//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use tidemq::broker::{Broker, BrokerConfig};
use tidemq::codec::{Decoder, Encoder};
use tidemq::protocol::{
    ConnAck, Connect, Packet, Publish, QoS, SubAckReturnCode, Subscribe, Subscription, Will,
};

/// Test configuration helper: ephemeral port, long retry interval
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        retry_interval: Duration::from_secs(30),
        node_id: "test-node".to_string(),
        ..Default::default()
    }
}

/// Start a broker and return it with the bound address
pub async fn start_broker(config: BrokerConfig) -> (Broker, SocketAddr) {
    let broker = Broker::new(config);
    let addr = broker.start().await.expect("Failed to start broker");
    (broker, addr)
}

/// Helper struct for MQTT client operations in tests
pub struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(1024 * 1024),
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet, or None on timeout or EOF
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = Instant::now() + wait;
        loop {
            match self.decoder.decode(&self.buf) {
                Ok(Some((packet, consumed))) => {
                    self.buf.advance(consumed);
                    return Some(packet);
                }
                Ok(None) => {}
                Err(e) => panic!("Failed to decode server packet: {}", e),
            }
            match timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    pub async fn expect_nothing(&mut self, wait: Duration) {
        if let Some(packet) = self.recv_within(wait).await {
            panic!("Expected no packet, got {:?}", packet);
        }
    }

    /// True once the server has closed the connection
    pub async fn is_closed(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut scratch = [0u8; 256];
            match timeout_at(deadline, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    pub async fn mqtt_connect_packet(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    pub async fn mqtt_connect(&mut self, client_id: &str) -> ConnAck {
        self.mqtt_connect_packet(Connect {
            client_id: client_id.to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn mqtt_connect_with_will(&mut self, client_id: &str, will: Will) -> ConnAck {
        self.mqtt_connect_packet(Connect {
            client_id: client_id.to_string(),
            will: Some(will),
            ..Default::default()
        })
        .await
    }

    /// Subscribe to one filter and return the SUBACK codes
    pub async fn subscribe(
        &mut self,
        packet_id: u16,
        filter: &str,
        qos: QoS,
    ) -> Vec<SubAckReturnCode> {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                ack.return_codes
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        packet_id: Option<u16>,
        retain: bool,
    ) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    pub async fn ping(&mut self) {
        self.send(&Packet::PingReq).await;
        match self.recv().await {
            Some(Packet::PingResp) => {}
            other => panic!("Expected PINGRESP, got {:?}", other),
        }
    }
}
