//! Full application: WebSocket clients and OSC clients around one scene
//!
//! The WebSocket side speaks just enough RFC 6455 over a plain TCP stream
//! for short text frames.

use serde_json::{json, Value};
use soundscape_app::Soundscape;
use soundscape_core::domain::{OscMode, SoundscapeConfig};
use soundscape_infra::osc::OscType;
use soundscape_tests::Peer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(2);

struct WsClient {
    stream: TcpStream,
}

impl WsClient {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /ws HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        Self { stream }
    }

    /// Send a masked text frame
    async fn send(&mut self, value: &Value) {
        let payload = value.to_string().into_bytes();
        let mask = [0x12u8, 0x34, 0x56, 0x78];
        let mut frame = vec![0x81u8];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Next text frame as JSON
    async fn recv(&mut self) -> Value {
        timeout(LIMIT, async {
            loop {
                let mut header = [0u8; 2];
                self.stream.read_exact(&mut header).await.unwrap();
                let len = match header[1] & 0x7f {
                    126 => u64::from(self.stream.read_u16().await.unwrap()),
                    127 => self.stream.read_u64().await.unwrap(),
                    n => u64::from(n),
                };
                let mut payload = vec![0u8; len as usize];
                self.stream.read_exact(&mut payload).await.unwrap();
                if header[0] & 0x0f == 0x1 {
                    return serde_json::from_slice(&payload).unwrap();
                }
            }
        })
        .await
        .expect("text frame within the limit")
    }
}

fn config() -> SoundscapeConfig {
    let mut config = SoundscapeConfig::factory_default();
    config.app.block_size = 64;
    config.websocket.port = 0;
    config
}

// ============================================================================
// WEBSOCKET
// ============================================================================

#[tokio::test]
async fn test_websocket_subscription_replay() {
    let soundscape = Soundscape::start(&config()).await.unwrap();
    let mut client = WsClient::connect(soundscape.websocket_addr().unwrap()).await;

    client.send(&json!(["subscribe", ["renderer"]])).await;
    let frame = client.recv().await;
    assert_eq!(frame[0], json!("state"));
    assert_eq!(frame[1]["renderer-name"], json!("simulated"));
    assert_eq!(frame[1]["loudspeakers"].as_array().unwrap().len(), 8);

    soundscape.shutdown().await;
}

#[tokio::test]
async fn test_websocket_clients_see_each_other() {
    let soundscape = Soundscape::start(&config()).await.unwrap();
    let addr = soundscape.websocket_addr().unwrap();
    let mut editor = WsClient::connect(addr).await;
    let mut viewer = WsClient::connect(addr).await;

    viewer.send(&json!(["subscribe", ["scene"]])).await;
    viewer.recv().await;

    editor
        .send(&json!(["new-src", [{"id": "guitar", "port-number": 4, "pos": [2.0, 0.0]}]]))
        .await;
    let frame = viewer.recv().await;
    assert_eq!(frame[0], json!("new-src"));
    assert_eq!(frame[1]["guitar"]["port-name"], json!("system:capture_4"));
    assert_eq!(frame[1]["guitar"]["pos"], json!([2.0, 0.0, 0.0]));

    editor.send(&json!(["mod-src", {"ghost": {"mute": true}}])).await;
    let error = editor.recv().await;
    assert_eq!(error[0], json!("error"));

    soundscape.shutdown().await;
}

// ============================================================================
// BRIDGES TOGETHER
// ============================================================================

#[tokio::test]
async fn test_websocket_changes_reach_osc_clients() {
    let osc_client = Peer::bind().await;
    let mut config = config();
    config.osc.mode = OscMode::Server;
    config.osc.port = 0;
    config.osc.clients = vec![osc_client.addr().to_string()];
    config.osc.poll_interval_ms = 10_000;

    let soundscape = Soundscape::start(&config).await.unwrap();
    osc_client.collect(Duration::from_millis(200)).await;

    let mut editor = WsClient::connect(soundscape.websocket_addr().unwrap()).await;
    editor
        .send(&json!(["new-src", [{"id": "choir", "port-number": 1, "name": "Choir"}]]))
        .await;

    let (_, message) = osc_client.expect("/source/new", LIMIT).await.unwrap();
    assert_eq!(message.args[1], OscType::String("Choir".to_string()));
    assert_eq!(message.args[3], OscType::String("system:capture_1".to_string()));

    editor.send(&json!(["state", {"master-volume": 0.5}])).await;
    let (_, message) = osc_client.expect("/scene/volume", LIMIT).await.unwrap();
    match message.args[0] {
        OscType::Float(db) => assert!((db - -6.0206).abs() < 1e-2),
        ref other => panic!("unexpected volume argument {:?}", other),
    }

    soundscape.shutdown().await;
}
