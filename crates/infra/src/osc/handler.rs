//! OSC bridge lifecycle: UDP socket, peer bookkeeping and the three tasks
//!
//! - receive task: decodes packets, tracks peers, applies commands
//! - send task: drains the Sender's packet queue to the peers whose message
//!   level takes that class of packet
//! - poll task (server role): sends `/poll` and drops silent clients

use crate::osc::codec::{decode, OscMessage};
use crate::osc::ordinal::OrdinalTable;
use crate::osc::receiver::{OscCommand, OscReceiver};
use crate::osc::sender::{OscSender, Packet, PacketClass, Role};
use soundscape_core::domain::{
    MessageLevel, MeteringKind, OscConfig, OscMode, Publisher, Subscription,
};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Learned clients are dropped after this many unanswered polls
pub const MAX_MISSED_POLLS: u32 = 5;

const MAX_PACKET: usize = 65_536;

#[derive(Debug, Clone, Copy)]
struct Client {
    missed_polls: u32,
    configured: bool,
    level: MessageLevel,
}

/// Where outbound packets go
#[derive(Debug)]
pub struct Peers {
    role: Role,
    clients: HashMap<SocketAddr, Client>,
    server: Option<SocketAddr>,
    client_level: MessageLevel,
}

impl Peers {
    /// `client_level` applies to every client until it sends its own
    pub fn new(
        role: Role,
        clients: Vec<SocketAddr>,
        server: Option<SocketAddr>,
        client_level: MessageLevel,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    Client {
                        missed_polls: 0,
                        configured: true,
                        level: client_level,
                    },
                )
            })
            .collect();
        Self {
            role,
            clients,
            server,
            client_level,
        }
    }

    /// Every address the Sender's packets may go to
    pub fn targets(&self) -> Vec<SocketAddr> {
        match self.role {
            Role::Server => self.clients.keys().copied().collect(),
            Role::Client => self.server.into_iter().collect(),
        }
    }

    /// Addresses taking packets of `class`
    ///
    /// The upstream server of a client-role bridge is at `Server` level and
    /// never takes metering.
    pub fn targets_for(&self, class: PacketClass) -> Vec<SocketAddr> {
        let takes = |level: MessageLevel| class == PacketClass::Scene || level.wants_metering();
        match self.role {
            Role::Server => self
                .clients
                .iter()
                .filter(|(_, client)| takes(client.level))
                .map(|(addr, _)| *addr)
                .collect(),
            Role::Client => self
                .server
                .filter(|_| takes(MessageLevel::Server))
                .into_iter()
                .collect(),
        }
    }

    pub fn message_level(&self, addr: SocketAddr) -> Option<MessageLevel> {
        match self.role {
            Role::Server => self.clients.get(&addr).map(|client| client.level),
            Role::Client => (self.server == Some(addr)).then_some(MessageLevel::Server),
        }
    }

    /// Change the level of a known client; returns false for unknown ones
    pub fn set_message_level(&mut self, addr: SocketAddr, level: MessageLevel) -> bool {
        match self.clients.get_mut(&addr) {
            Some(client) => {
                client.level = level;
                true
            }
            None => false,
        }
    }

    /// A client spoke; returns true if it was not known before
    pub fn client_seen(&mut self, addr: SocketAddr) -> bool {
        match self.clients.get_mut(&addr) {
            Some(client) => {
                client.missed_polls = 0;
                false
            }
            None => {
                self.clients.insert(
                    addr,
                    Client {
                        missed_polls: 0,
                        configured: false,
                        level: self.client_level,
                    },
                );
                true
            }
        }
    }

    /// The server polled us; returns true if the server address changed
    pub fn server_seen(&mut self, addr: SocketAddr) -> bool {
        self.server.replace(addr) != Some(addr)
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Count one more poll and return the clients to poll
    ///
    /// Learned clients that missed too many polls are forgotten; configured
    /// ones are polled forever.
    pub fn poll_round(&mut self) -> Vec<SocketAddr> {
        self.clients.retain(|addr, client| {
            let keep = client.configured || client.missed_polls < MAX_MISSED_POLLS;
            if !keep {
                info!(%addr, "OSC client timed out");
            }
            keep
        });
        for client in self.clients.values_mut() {
            client.missed_polls = client.missed_polls.saturating_add(1);
        }
        self.clients.keys().copied().collect()
    }
}

type SharedPeers = Arc<Mutex<Peers>>;

fn lock(peers: &SharedPeers) -> MutexGuard<'_, Peers> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn resolve(address: &str) -> Option<SocketAddr> {
    match lookup_host(address).await {
        Ok(mut addrs) => {
            let addr = addrs.next();
            if addr.is_none() {
                warn!(address, "OSC address resolved to nothing");
            }
            addr
        }
        Err(e) => {
            warn!(address, error = %e, "Cannot resolve OSC address");
            None
        }
    }
}

/// A running OSC bridge
pub struct OscHandler {
    local_addr: SocketAddr,
    peers: SharedPeers,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl OscHandler {
    /// Bind the socket, subscribe the Sender and spawn the tasks
    #[instrument(skip(publisher, config), fields(mode = %config.mode, port = config.port))]
    pub async fn start(publisher: Arc<Publisher>, config: &OscConfig) -> io::Result<Self> {
        let role = match config.mode {
            OscMode::Server => Role::Server,
            OscMode::Client => Role::Client,
            OscMode::Off => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "OSC bridge is disabled",
                ))
            }
        };

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?);
        let local_addr = socket.local_addr()?;

        let mut clients = Vec::new();
        if role == Role::Server {
            for address in &config.clients {
                clients.extend(resolve(address).await);
            }
        }
        let server = match (&config.server, role) {
            (Some(address), Role::Client) => resolve(address).await,
            _ => None,
        };
        let peers = Arc::new(Mutex::new(Peers::new(role, clients, server, config.client_level)));

        let ordinals = Arc::new(Mutex::new(OrdinalTable::new()));
        let (outbox, queue) = mpsc::unbounded_channel();
        let sender = Arc::new(OscSender::new(
            role,
            ordinals.clone(),
            outbox,
            config.trace_messages,
        ));
        let receiver = Arc::new(OscReceiver::new(publisher.clone(), sender.clone(), ordinals));

        let subscriptions = {
            let publisher = publisher.clone();
            let sender = sender.clone();
            tokio::task::spawn_blocking(move || subscribe(&publisher, sender))
                .await
                .map_err(io::Error::other)?
        };

        let token = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(receive_loop(
                socket.clone(),
                peers.clone(),
                receiver,
                role,
                config.trace_messages,
                token.clone(),
            )),
            tokio::spawn(send_loop(socket.clone(), peers.clone(), queue, token.clone())),
        ];
        if role == Role::Server {
            tasks.push(tokio::spawn(poll_loop(
                socket,
                peers.clone(),
                config.poll_interval(),
                token.clone(),
            )));
        }

        info!(%local_addr, ?role, "OSC bridge started");
        Ok(Self {
            local_addr,
            peers,
            token,
            tasks,
            subscriptions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current send targets
    pub fn targets(&self) -> Vec<SocketAddr> {
        lock(&self.peers).targets()
    }

    pub fn message_level(&self, addr: SocketAddr) -> Option<MessageLevel> {
        lock(&self.peers).message_level(addr)
    }

    /// Cancel and await the tasks, then unsubscribe
    pub async fn stop(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "OSC task failed");
            }
        }
        self.subscriptions.clear();
        info!("OSC bridge stopped");
    }
}

impl Drop for OscHandler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn subscribe(publisher: &Publisher, sender: Arc<OscSender>) -> Vec<Subscription> {
    let mut subscribe = publisher.subscribe();
    // information first so a replayed source is staged before its fields
    let mut subscriptions = vec![
        subscribe.scene_information(sender.clone()),
        subscribe.scene_control(sender.clone()),
        subscribe.renderer_control(sender.clone()),
        subscribe.renderer_information(sender.clone()),
        subscribe.transport(sender.clone()),
    ];
    for kind in [
        MeteringKind::SourceLevel,
        MeteringKind::MasterLevel,
        MeteringKind::CpuLoad,
    ] {
        subscriptions.push(subscribe.metering(kind, sender.clone()));
    }
    subscriptions
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    peers: SharedPeers,
    receiver: Arc<OscReceiver>,
    role: Role,
    trace_messages: bool,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let (len, from) = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port-unreachable from a vanished peer surfaces here
                    debug!(error = %e, "OSC receive failed");
                    continue;
                }
            },
        };

        let messages = match decode(&buf[..len]) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed OSC packet");
                continue;
            }
        };

        for message in messages {
            if trace_messages {
                debug!(peer = %from, path = %message.path, tags = %message.tags(), "OSC in");
            } else {
                trace!(peer = %from, path = %message.path, tags = %message.tags(), "OSC in");
            }
            let command = match OscCommand::parse(&message) {
                Ok(command) => command,
                Err(e) => {
                    warn!(peer = %from, error = %e, "Dropping OSC message");
                    continue;
                }
            };
            handle(&socket, &peers, &receiver, role, from, command).await;
        }
    }
    debug!("OSC receive task finished");
}

async fn handle(
    socket: &UdpSocket,
    peers: &SharedPeers,
    receiver: &Arc<OscReceiver>,
    role: Role,
    from: SocketAddr,
    command: OscCommand,
) {
    match (role, &command) {
        (Role::Client, OscCommand::Poll) => {
            if lock(peers).server_seen(from) {
                info!(server = %from, "OSC server discovered");
            }
            let alive = OscMessage::new("/alive", Vec::new()).encode();
            if let Err(e) = socket.send_to(&alive, from).await {
                debug!(server = %from, error = %e, "Cannot answer poll");
            }
            return;
        }
        (Role::Server, _) => {
            let mut peers = lock(peers);
            if peers.client_seen(from) {
                info!(client = %from, "OSC client connected");
            }
            match command {
                OscCommand::MessageLevel(level) => {
                    peers.set_message_level(from, level);
                    info!(client = %from, ?level, "OSC client message level set");
                    return;
                }
                OscCommand::Alive | OscCommand::Update(_) => return,
                _ => {}
            }
        }
        (
            Role::Client,
            OscCommand::Alive | OscCommand::Update(_) | OscCommand::MessageLevel(_),
        ) => return,
        (Role::Client, _) => {}
    }
    if matches!(command, OscCommand::Poll) {
        return;
    }

    let receiver = receiver.clone();
    match tokio::task::spawn_blocking(move || receiver.apply(command)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(peer = %from, error = %e, "OSC command rejected"),
        Err(e) => warn!(peer = %from, error = %e, "OSC command task failed"),
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    peers: SharedPeers,
    mut queue: mpsc::UnboundedReceiver<Packet>,
    token: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => break,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let targets = lock(&peers).targets_for(packet.class);
        for target in targets {
            if let Err(e) = socket.send_to(&packet.bytes, target).await {
                debug!(%target, error = %e, "OSC send failed");
            }
        }
    }
    debug!("OSC send task finished");
}

async fn poll_loop(
    socket: Arc<UdpSocket>,
    peers: SharedPeers,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let poll = OscMessage::new("/poll", Vec::new()).encode();
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let targets = lock(&peers).poll_round();
        for target in targets {
            if let Err(e) = socket.send_to(&poll, target).await {
                debug!(%target, error = %e, "OSC poll failed");
            }
        }
    }
    debug!("OSC poll task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_learned_clients_time_out() {
        let mut peers = Peers::new(Role::Server, vec![addr(1)], None, MessageLevel::ThinClient);
        assert!(peers.client_seen(addr(2)));
        assert!(!peers.client_seen(addr(2)));

        for _ in 0..MAX_MISSED_POLLS {
            assert_eq!(peers.poll_round().len(), 2);
        }
        // configured client stays, learned one is gone
        assert_eq!(peers.poll_round(), vec![addr(1)]);
    }

    #[test]
    fn test_answer_resets_missed_polls() {
        let mut peers = Peers::new(Role::Server, Vec::new(), None, MessageLevel::ThinClient);
        peers.client_seen(addr(2));
        for _ in 0..10 {
            peers.poll_round();
            peers.client_seen(addr(2));
        }
        assert_eq!(peers.targets(), vec![addr(2)]);
    }

    #[test]
    fn test_client_targets_server() {
        let mut peers = Peers::new(Role::Client, Vec::new(), None, MessageLevel::Client);
        assert!(peers.targets().is_empty());
        assert!(peers.server_seen(addr(9)));
        assert!(!peers.server_seen(addr(9)));
        assert_eq!(peers.targets(), vec![addr(9)]);
    }

    #[test]
    fn test_metering_follows_message_level() {
        let mut peers = Peers::new(Role::Server, vec![addr(1)], None, MessageLevel::ThinClient);
        peers.client_seen(addr(2));
        assert!(peers.set_message_level(addr(2), MessageLevel::Client));
        assert!(!peers.set_message_level(addr(3), MessageLevel::Client));

        let mut scene = peers.targets_for(PacketClass::Scene);
        scene.sort();
        assert_eq!(scene, vec![addr(1), addr(2)]);
        assert_eq!(peers.targets_for(PacketClass::Metering), vec![addr(2)]);
        assert_eq!(peers.message_level(addr(1)), Some(MessageLevel::ThinClient));
    }

    #[test]
    fn test_server_never_gets_metering_from_client() {
        let mut peers = Peers::new(Role::Client, Vec::new(), None, MessageLevel::Client);
        peers.server_seen(addr(9));
        assert_eq!(peers.targets_for(PacketClass::Scene), vec![addr(9)]);
        assert!(peers.targets_for(PacketClass::Metering).is_empty());
    }
}
