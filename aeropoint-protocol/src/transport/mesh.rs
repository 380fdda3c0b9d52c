//! Mesh transport channel
//!
//! Short-range peer mesh built from two primitives: UDP broadcast identity
//! datagrams for discovery and a plain TCP session for movement reports.
//! Reports travel in the fixed 5-byte compact form, so stream framing is a
//! `read_exact` of one report at a time and never ambiguous.
//!
//! ## Discovery
//!
//! The receiver broadcasts a JSON identity datagram on the discovery port
//! at a fixed interval; senders bind the discovery port and collect
//! identities into peers. A peer that stops broadcasting for longer than
//! the timeout is reported lost.

use crate::transport::{
    Channel, ChannelEvent, ChannelState, Peer, PeerAddress, TransportKind,
};
use crate::{MotionReport, PacketClass, ProtocolError, Result, WireFormat, MIN_REPORT_LEN};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Default UDP port for mesh identity broadcasts
pub const MESH_DISCOVERY_PORT: u16 = 42710;

/// Broadcast address for identity datagrams
const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Ports tried above the configured discovery port when it is taken
///
/// Listeners bind the first free port in the range; broadcasters target
/// every port in it, so two instances on one host still see each other.
const MESH_PORT_RANGE: u16 = 4;

/// Mesh channel configuration
#[derive(Debug, Clone)]
pub struct MeshChannelConfig {
    /// This device's identifier (skips our own broadcasts)
    pub device_id: String,

    /// This device's human-readable name
    pub device_name: String,

    /// UDP discovery port
    pub discovery_port: u16,

    /// TCP session port for the receiver listener (0 = ephemeral)
    pub session_port: u16,

    /// How often the receiver broadcasts its identity
    pub broadcast_interval: Duration,

    /// How long before a silent peer is reported lost
    pub peer_timeout: Duration,

    /// Delay before retrying a connect issued against a cold channel
    pub bootstrap_delay: Duration,

    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for MeshChannelConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: "aeropoint".to_string(),
            discovery_port: MESH_DISCOVERY_PORT,
            session_port: 0,
            broadcast_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            bootstrap_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// Identity datagram broadcast by receivers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshIdentity {
    device_id: String,
    device_name: String,
    session_port: u16,
}

/// Mesh transport channel
pub struct MeshChannel {
    config: MeshChannelConfig,

    /// Connection state
    state: Arc<RwLock<ChannelState>>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<ChannelEvent>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<ChannelEvent>>>,

    /// Write half of the active session (sender side)
    session: Arc<RwLock<Option<OwnedWriteHalf>>>,

    /// Discovered peers with last-seen timestamps
    peers: Arc<RwLock<HashMap<String, (Peer, Instant)>>>,

    /// Actual TCP port the receiver listener bound to
    session_port: Arc<RwLock<Option<u16>>>,

    /// Background tasks (discovery, broadcast, accept, session readers)
    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl MeshChannel {
    /// Create a new mesh channel
    pub fn new(config: MeshChannelConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Arc::new(RwLock::new(ChannelState::Stopped)),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            session: Arc::new(RwLock::new(None)),
            peers: Arc::new(RwLock::new(HashMap::new())),
            session_port: Arc::new(RwLock::new(None)),
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a mesh channel with default configuration
    pub fn with_defaults() -> Self {
        Self::new(MeshChannelConfig::default())
    }

    /// Actual TCP port the receiver listener bound to, once advertising
    pub async fn local_session_port(&self) -> Option<u16> {
        *self.session_port.read().await
    }

    async fn set_state(&self, new: ChannelState) {
        let mut state = self.state.write().await;
        if *state == new {
            return;
        }
        debug!("mesh channel: {:?} -> {:?}", *state, new);
        *state = new.clone();
        drop(state);

        let _ = self.event_tx.send(ChannelEvent::StateChanged {
            kind: TransportKind::Mesh,
            state: new,
        });
    }

    /// Spawn the UDP listener collecting identity broadcasts
    async fn spawn_discovery_listener(&self, socket: Arc<UdpSocket>) {
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let own_id = self.config.device_id.clone();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("mesh discovery receive failed: {}", e);
                        break;
                    }
                };

                let identity: MeshIdentity = match serde_json::from_slice(&buf[..len]) {
                    Ok(id) => id,
                    Err(e) => {
                        debug!("ignoring malformed identity from {}: {}", src, e);
                        continue;
                    }
                };

                if identity.device_id == own_id {
                    continue;
                }

                let session_addr = SocketAddr::new(src.ip(), identity.session_port);
                let peer = Peer::new(
                    TransportKind::Mesh,
                    identity.device_id.clone(),
                    identity.device_name.clone(),
                    PeerAddress::Socket(session_addr),
                );

                let mut peers = peers.write().await;
                let is_new = peers
                    .get(&identity.device_id)
                    .map(|(known, _)| known != &peer)
                    .unwrap_or(true);
                peers.insert(identity.device_id.clone(), (peer.clone(), Instant::now()));
                drop(peers);

                if is_new {
                    info!("mesh peer discovered: {} at {}", peer.display_name, session_addr);
                    let _ = event_tx.send(ChannelEvent::PeerDiscovered(peer));
                }
            }
        });

        self.push_task(handle).await;
    }

    /// Spawn the checker that reports silent peers lost
    async fn spawn_peer_timeout_checker(&self) {
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();
        let peer_timeout = self.config.peer_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(peer_timeout / 2);

            loop {
                ticker.tick().await;

                let mut peers = peers.write().await;
                let now = Instant::now();
                let stale: Vec<String> = peers
                    .iter()
                    .filter(|(_, (_, seen))| now.duration_since(*seen) > peer_timeout)
                    .map(|(id, _)| id.clone())
                    .collect();

                for native_id in stale {
                    peers.remove(&native_id);
                    info!("mesh peer lost: {}", native_id);
                    let _ = event_tx.send(ChannelEvent::PeerLost {
                        kind: TransportKind::Mesh,
                        native_id,
                    });
                }
            }
        });

        self.push_task(handle).await;
    }

    /// Spawn the identity broadcaster (receiver side)
    async fn spawn_broadcaster(&self, socket: Arc<UdpSocket>, session_port: u16) {
        let identity = MeshIdentity {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            session_port,
        };
        // Listeners may have fallen back to a higher port, so every port in
        // the range gets the datagram. Port 0 means discovery is ephemeral
        // (no well-known port to reach) and nothing is broadcast.
        let base_port = self.config.discovery_port;
        let targets: Vec<SocketAddr> = if base_port == 0 {
            Vec::new()
        } else {
            (base_port..base_port.saturating_add(MESH_PORT_RANGE))
                .map(|port| SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), port))
                .collect()
        };
        let broadcast_interval = self.config.broadcast_interval;

        let handle = tokio::spawn(async move {
            let payload = match serde_json::to_vec(&identity) {
                Ok(p) => p,
                Err(e) => {
                    error!("failed to serialize mesh identity: {}", e);
                    return;
                }
            };

            let mut ticker = interval(broadcast_interval);
            loop {
                ticker.tick().await;
                for target in &targets {
                    if let Err(e) = socket.send_to(&payload, target).await {
                        warn!("mesh identity broadcast failed: {}", e);
                    }
                }
            }
        });

        self.push_task(handle).await;
    }

    /// Spawn the accept loop (receiver side)
    ///
    /// Sessions are read in their own task so the loop stays on accept and
    /// can refuse extra connections while one session is live.
    async fn spawn_accept_loop(&self, listener: TcpListener) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let tasks = self.tasks.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("mesh accept failed: {}", e);
                        break;
                    }
                };

                // One session at a time: refuse extras while one is live.
                if *state.read().await == ChannelState::Connected {
                    warn!("mesh: refusing second session from {}", remote);
                    drop(stream);
                    continue;
                }

                info!("mesh session accepted from {}", remote);
                *state.write().await = ChannelState::Connected;
                let _ = event_tx.send(ChannelEvent::StateChanged {
                    kind: TransportKind::Mesh,
                    state: ChannelState::Connected,
                });
                let _ = event_tx.send(ChannelEvent::Connected {
                    kind: TransportKind::Mesh,
                    remote: remote.to_string(),
                });

                let state = state.clone();
                let event_tx = event_tx.clone();
                let reader = tokio::spawn(async move {
                    Self::read_session(stream, &event_tx).await;

                    *state.write().await = ChannelState::Discovering;
                    let _ = event_tx.send(ChannelEvent::StateChanged {
                        kind: TransportKind::Mesh,
                        state: ChannelState::Discovering,
                    });
                });
                tasks.write().await.push(reader);
            }
        });

        self.push_task(handle).await;
    }

    /// Read compact-form reports off a session until it ends
    async fn read_session(mut stream: TcpStream, event_tx: &mpsc::UnboundedSender<ChannelEvent>) {
        let mut frame = [0u8; MIN_REPORT_LEN];

        loop {
            match stream.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("mesh session closed by peer");
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Mesh,
                        reason: None,
                    });
                    return;
                }
                Err(e) => {
                    warn!("mesh session read failed: {}", e);
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Mesh,
                        reason: Some(e.to_string()),
                    });
                    return;
                }
            }

            match PacketClass::from_header(frame[0]) {
                Ok(PacketClass::Movement) => {
                    match MotionReport::decode(&frame, WireFormat::Compact) {
                        Ok(report) => {
                            let _ = event_tx.send(ChannelEvent::ReportReceived {
                                kind: TransportKind::Mesh,
                                report,
                            });
                        }
                        Err(e) => debug!("dropping malformed mesh report: {}", e),
                    }
                }
                Ok(PacketClass::Control) => {
                    // Control frames are session-level chatter; the movement
                    // path ignores them.
                    debug!("mesh control frame ignored");
                }
                Err(e) => {
                    // A bad header on a stream means framing drift; drop the
                    // session rather than replay garbage as motion.
                    warn!("mesh framing lost ({}), dropping session", e);
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Mesh,
                        reason: Some("framing lost".to_string()),
                    });
                    return;
                }
            }
        }
    }

    /// Watch the sender-side session for remote close
    async fn spawn_session_watcher(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let state = self.state.clone();
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut sink = [0u8; 64];
            let reason = loop {
                match read_half.read(&mut sink).await {
                    Ok(0) => break None,
                    Ok(_) => continue, // control backchannel, ignored
                    Err(e) => break Some(e.to_string()),
                }
            };

            session.write().await.take();
            *state.write().await = ChannelState::Discovering;
            let _ = event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Mesh,
                reason,
            });
            let _ = event_tx.send(ChannelEvent::StateChanged {
                kind: TransportKind::Mesh,
                state: ChannelState::Discovering,
            });
        });

        self.push_task(handle).await;
    }

    async fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks.write().await.push(handle);
    }

    /// Stop the channel entirely, aborting all background tasks
    pub async fn stop(&self) {
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }
        self.session.write().await.take();
        self.set_state(ChannelState::Stopped).await;
        info!("mesh channel stopped");
    }
}

#[async_trait]
impl Channel for MeshChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    async fn state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    async fn start_discovery(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("mesh discovery already active ({:?})", current);
            return Ok(());
        }

        let socket = bind_discovery_socket(self.config.discovery_port).await?;
        info!(
            "mesh discovery listening on UDP {}",
            socket.local_addr().map_err(ProtocolError::Io)?.port()
        );

        self.spawn_discovery_listener(Arc::new(socket)).await;
        self.spawn_peer_timeout_checker().await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn start_advertising(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("mesh advertising already active ({:?})", current);
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.session_port))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding mesh session listener"))?;
        let port = listener
            .local_addr()
            .map_err(ProtocolError::Io)?
            .port();
        *self.session_port.write().await = Some(port);

        let broadcast_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding mesh broadcast socket"))?;
        broadcast_socket
            .set_broadcast(true)
            .map_err(ProtocolError::Io)?;

        info!("mesh advertising: session on TCP {}", port);
        self.spawn_broadcaster(Arc::new(broadcast_socket), port).await;
        self.spawn_accept_loop(listener).await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<()> {
        let addr = match &peer.address {
            PeerAddress::Socket(addr) => *addr,
            other => {
                return Err(ProtocolError::InvalidState(format!(
                    "mesh cannot connect to {}",
                    other
                )))
            }
        };

        // A connect against a cold channel bootstraps discovery first and
        // waits a bounded delay so the underlying session can initialize.
        // A bind failure here is not fatal: the target address is already
        // known, so the direct connect can still proceed.
        if *self.state.read().await == ChannelState::Stopped {
            if let Err(e) = self.start_discovery().await {
                warn!("mesh bootstrap discovery failed, connecting directly: {}", e);
            }
            tokio::time::sleep(self.config.bootstrap_delay).await;
        }

        self.set_state(ChannelState::Connecting).await;
        info!("mesh connecting to {} at {}", peer.display_name, addr);

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ChannelState::Discovering).await;
                return Err(ProtocolError::from_io_error(e, "mesh connect"));
            }
            Err(_) => {
                // Never left half-connected: revert to browsing.
                self.set_state(ChannelState::Discovering).await;
                return Err(ProtocolError::Timeout(format!(
                    "mesh connect to {} exceeded {:?}",
                    addr, self.config.connect_timeout
                )));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            self.set_state(ChannelState::Discovering).await;
            return Err(ProtocolError::Io(e));
        }
        let (read_half, write_half) = stream.into_split();
        *self.session.write().await = Some(write_half);
        self.spawn_session_watcher(read_half).await;

        self.set_state(ChannelState::Connected).await;
        let _ = self.event_tx.send(ChannelEvent::Connected {
            kind: TransportKind::Mesh,
            remote: addr.to_string(),
        });
        info!("mesh connected to {}", addr);
        Ok(())
    }

    async fn send(&self, report: &MotionReport) -> Result<()> {
        let mut session = self.session.write().await;
        let writer = session.as_mut().ok_or_else(|| {
            ProtocolError::SendFailed("mesh: no active session".to_string())
        })?;

        let bytes = report.encode(WireFormat::Compact);
        if let Err(e) = writer.write_all(&bytes).await {
            session.take();
            drop(session);
            self.set_state(ChannelState::Discovering).await;
            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Mesh,
                reason: Some(e.to_string()),
            });
            return Err(ProtocolError::SendFailed(format!("mesh write: {}", e)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let had_session = self.session.write().await.take().is_some();

        if had_session {
            // Dropping the write half shuts the socket down synchronously;
            // background discovery keeps running so another target can be
            // picked without restarting the browse.
            self.set_state(ChannelState::Discovering).await;
            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Mesh,
                reason: None,
            });
            info!("mesh session disconnected");
        }
        Ok(())
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }
}

/// Bind the discovery listener, falling back through the port range when
/// the configured port is taken. Port 0 binds an ephemeral port directly.
async fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    if port == 0 {
        return UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding mesh discovery port"));
    }

    let mut last_err = std::io::Error::from(std::io::ErrorKind::AddrInUse);
    for candidate in port..port.saturating_add(MESH_PORT_RANGE) {
        match UdpSocket::bind(("0.0.0.0", candidate)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = e,
        }
    }
    Err(ProtocolError::from_io_error(
        last_err,
        "binding mesh discovery port",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ButtonFlags;

    fn test_config(name: &str) -> MeshChannelConfig {
        MeshChannelConfig {
            device_name: name.to_string(),
            // Ephemeral ports so parallel tests never collide.
            discovery_port: 0,
            session_port: 0,
            bootstrap_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_serialization() {
        let identity = MeshIdentity {
            device_id: "abc".to_string(),
            device_name: "Handheld".to_string(),
            session_port: 42711,
        };

        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"deviceId\":\"abc\""));
        assert!(json.contains("\"sessionPort\":42711"));

        let parsed: MeshIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.device_name, "Handheld");
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped() {
        let channel = MeshChannel::new(test_config("a"));
        assert_eq!(channel.state().await, ChannelState::Stopped);
        assert!(!channel.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_without_session_fails_as_send_failed() {
        let channel = MeshChannel::new(test_config("a"));
        let report = MotionReport::new(ButtonFlags::LEFT, 1, 1, 0);

        let result = channel.send(&report).await;
        assert!(matches!(result, Err(ProtocolError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_loopback_session_delivers_reports_in_order() {
        let receiver = MeshChannel::new(test_config("receiver"));
        receiver.start_advertising().await.unwrap();
        let port = receiver.local_session_port().await.unwrap();
        let mut events = receiver.subscribe().await;

        let sender = MeshChannel::new(test_config("sender"));
        let peer = Peer::new(
            TransportKind::Mesh,
            "receiver",
            "receiver",
            PeerAddress::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        );
        sender.connect(&peer).await.unwrap();
        assert!(sender.is_connected().await);

        for dx in 1..=3i16 {
            sender
                .send(&MotionReport::new(ButtonFlags::default(), dx, -dx, 0))
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::ReportReceived { report, .. }) => received.push(report),
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }

        // In-order delivery on a single channel is part of the contract.
        assert_eq!(received[0].dx, 1);
        assert_eq!(received[1].dx, 2);
        assert_eq!(received[2].dx, 3);

        sender.disconnect().await.unwrap();
        receiver.stop().await;
        sender.stop().await;
    }

    #[tokio::test]
    async fn test_connect_timeout_reverts_to_discovering() {
        // A listener with a saturated accept queue never completes new
        // handshakes, so a connect against it hangs until the timeout.
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut parked = Vec::new();
        for _ in 0..3 {
            if let Ok(Ok(stream)) =
                timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
            {
                parked.push(stream);
            }
        }

        let sender = MeshChannel::new(MeshChannelConfig {
            connect_timeout: Duration::from_millis(250),
            ..test_config("sender")
        });
        let peer = Peer::new(
            TransportKind::Mesh,
            "receiver",
            "receiver",
            PeerAddress::Socket(addr),
        );

        let result = sender.connect(&peer).await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
        assert_eq!(sender.state().await, ChannelState::Discovering);

        drop(parked);
        sender.stop().await;
    }

    #[tokio::test]
    async fn test_refused_connect_reverts_to_discovering() {
        let sender = MeshChannel::new(test_config("sender"));

        // Grab a free port and close it again so nothing listens there.
        let probe_port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let peer = Peer::new(
            TransportKind::Mesh,
            "receiver",
            "receiver",
            PeerAddress::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), probe_port)),
        );

        assert!(sender.connect(&peer).await.is_err());
        assert_eq!(sender.state().await, ChannelState::Discovering);

        sender.stop().await;
    }

    #[tokio::test]
    async fn test_second_session_refused_while_one_live() {
        let receiver = MeshChannel::new(test_config("receiver"));
        receiver.start_advertising().await.unwrap();
        let port = receiver.local_session_port().await.unwrap();
        let mut events = receiver.subscribe().await;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let mut first = TcpStream::connect(addr).await.unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::Connected { .. }) => break,
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }

        // The extra connection is accepted by the kernel, then dropped by
        // the channel: the client sees an immediate close.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut sink = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut sink))
            .await
            .expect("refusal")
            .unwrap();
        assert_eq!(n, 0);

        // The first session is unaffected.
        let report = MotionReport::new(ButtonFlags::MIDDLE, 7, -7, 0);
        first
            .write_all(&report.encode(WireFormat::Compact))
            .await
            .unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::ReportReceived { report, .. }) => {
                    assert_eq!((report.dx, report.dy), (7, -7));
                    break;
                }
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }

        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_bind_falls_back_when_port_taken() {
        // Occupy an ephemeral port, then ask for that same port.
        let taken = UdpSocket::bind(("0.0.0.0", 0)).await.unwrap();
        let base = taken.local_addr().unwrap().port();

        let socket = bind_discovery_socket(base).await.unwrap();
        let bound = socket.local_addr().unwrap().port();
        assert_ne!(bound, base);
        assert!(bound > base && bound < base + MESH_PORT_RANGE);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let channel = MeshChannel::new(test_config("a"));
        assert!(channel.disconnect().await.is_ok());
        assert_eq!(channel.state().await, ChannelState::Stopped);
    }
}
