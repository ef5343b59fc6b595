//! Shared fixtures for the end-to-end tests

use soundscape_core::domain::{
    config::circular_array, Publisher, PublisherSettings, TomlSceneStore,
};
use soundscape_infra::osc::codec::decode;
use soundscape_infra::osc::OscMessage;
use soundscape_infra::{FilePlayer, SimulatedRenderer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

/// A Publisher over a simulated engine with four loudspeakers
pub struct Rig {
    pub renderer: Arc<SimulatedRenderer>,
    pub publisher: Arc<Publisher>,
}

impl Rig {
    /// Engine not started: `sync` returns at once
    pub fn idle() -> Self {
        let renderer = Arc::new(SimulatedRenderer::new("rig", 48000, 64, circular_array(4, 1.5)));
        let publisher = Arc::new(Publisher::new(
            renderer.clone(),
            Arc::new(FilePlayer::default()),
            Arc::new(TomlSceneStore::new()),
            PublisherSettings::default(),
        ));
        Self {
            renderer,
            publisher,
        }
    }

    /// Engine with its audio thread running
    pub fn running() -> Self {
        let rig = Self::idle();
        rig.renderer
            .start()
            .expect("audio thread should start");
        rig
    }
}

/// A UDP socket standing in for a remote OSC peer
pub struct Peer {
    pub socket: UdpSocket,
}

impl Peer {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind peer socket");
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("peer address")
    }

    pub async fn send(&self, message: &OscMessage, to: SocketAddr) {
        self.socket
            .send_to(&message.encode(), to)
            .await
            .expect("send OSC packet");
    }

    /// Every message received within `window`
    pub async fn collect(&self, window: Duration) -> Vec<(SocketAddr, OscMessage)> {
        let deadline = Instant::now() + window;
        let mut buf = vec![0u8; 65_536];
        let mut received = Vec::new();
        while let Ok(Ok((len, from))) = timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            if let Ok(messages) = decode(&buf[..len]) {
                received.extend(messages.into_iter().map(|m| (from, m)));
            }
        }
        received
    }

    /// Wait for the first message on `path`, up to `limit`
    pub async fn expect(&self, path: &str, limit: Duration) -> Option<(SocketAddr, OscMessage)> {
        let deadline = Instant::now() + limit;
        let mut buf = vec![0u8; 65_536];
        while let Ok(Ok((len, from))) = timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            if let Ok(messages) = decode(&buf[..len]) {
                if let Some(message) = messages.into_iter().find(|m| m.path == path) {
                    return Some((from, message));
                }
            }
        }
        None
    }
}

/// Loopback address of a socket bound to the unspecified address
pub fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}
