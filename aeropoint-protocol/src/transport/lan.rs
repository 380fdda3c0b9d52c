//! Lan transport channel
//!
//! Local-network transport: mDNS-SD for advertise/browse and plain UDP
//! datagrams for movement. Each datagram carries exactly one HID-form
//! report, so the optional trailing scroll byte is unambiguous — the
//! datagram boundary is the frame boundary. Legacy senders that emit
//! `"MOVE:<dx>,<dy>\n"` text datagrams are also accepted, including
//! several commands concatenated in one datagram.
//!
//! UDP has no sessions, so the receiver synthesizes connection semantics:
//! the first datagram from a source marks the channel `Connected` to that
//! source, and an idle timeout marks it disconnected again. Datagrams from
//! other sources are dropped while one source is live.
//!
//! Some platforms gate multicast behind a local-network permission and
//! deny it without ever showing a prompt. That condition surfaces from the
//! mDNS stack as an opaque error; [`map_mdns_error`] remaps it into a
//! single actionable `PermissionDenied`.

use crate::transport::{
    Channel, ChannelEvent, ChannelState, Peer, PeerAddress, TransportKind,
};
use crate::{decode_legacy, MotionReport, ProtocolError, Result, WireFormat};
use async_trait::async_trait;
use mdns_sd::{Receiver as MdnsReceiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// mDNS service type for lan discovery
pub const LAN_SERVICE_TYPE: &str = "_aeropoint._udp.local.";

/// Default UDP port for lan movement datagrams on the receiver
pub const LAN_DEFAULT_PORT: u16 = 42712;

/// Prefix of legacy text movement datagrams
const LEGACY_PREFIX: &[u8] = b"MOVE:";

/// Lan channel configuration
#[derive(Debug, Clone)]
pub struct LanChannelConfig {
    /// This device's identifier (mDNS TXT `id`)
    pub device_id: String,

    /// This device's human-readable name (mDNS instance name, TXT `name`)
    pub device_name: String,

    /// UDP port the receiver listens on (0 = ephemeral)
    pub port: u16,

    /// Idle gap after which the synthesized session is considered gone
    pub idle_timeout: Duration,

    /// Delay before retrying a connect issued against a cold channel
    pub bootstrap_delay: Duration,
}

impl Default for LanChannelConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: "aeropoint".to_string(),
            port: LAN_DEFAULT_PORT,
            idle_timeout: Duration::from_secs(10),
            bootstrap_delay: Duration::from_millis(500),
        }
    }
}

/// Remap mDNS stack errors into the channel error taxonomy
///
/// The load-bearing case is the permission sentinel: multicast denied with
/// no prompt shown. Users cannot act on the raw error text, so it becomes
/// one well-known `PermissionDenied` message.
fn map_mdns_error(e: mdns_sd::Error) -> ProtocolError {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        ProtocolError::PermissionDenied(
            "local network access denied (no system prompt is shown for multicast); \
             allow local network access in system settings"
                .to_string(),
        )
    } else {
        ProtocolError::Transport(format!("mdns: {}", text))
    }
}

/// Lan transport channel
pub struct LanChannel {
    config: LanChannelConfig,

    /// Connection state
    state: Arc<RwLock<ChannelState>>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<ChannelEvent>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<ChannelEvent>>>,

    /// mDNS daemon (created on first start)
    daemon: Arc<RwLock<Option<ServiceDaemon>>>,

    /// Connected send socket (sender side)
    send_socket: Arc<RwLock<Option<Arc<UdpSocket>>>>,

    /// fullname -> native id, for mapping ServiceRemoved to PeerLost
    known_services: Arc<RwLock<HashMap<String, String>>>,

    /// Actual UDP port the receiver bound to
    local_port: Arc<RwLock<Option<u16>>>,

    /// Background tasks
    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl LanChannel {
    /// Create a new lan channel
    pub fn new(config: LanChannelConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Arc::new(RwLock::new(ChannelState::Stopped)),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            daemon: Arc::new(RwLock::new(None)),
            send_socket: Arc::new(RwLock::new(None)),
            known_services: Arc::new(RwLock::new(HashMap::new())),
            local_port: Arc::new(RwLock::new(None)),
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a lan channel with default configuration
    pub fn with_defaults() -> Self {
        Self::new(LanChannelConfig::default())
    }

    /// Actual UDP port the receiver bound to, once advertising
    pub async fn local_udp_port(&self) -> Option<u16> {
        *self.local_port.read().await
    }

    async fn set_state(&self, new: ChannelState) {
        let mut state = self.state.write().await;
        if *state == new {
            return;
        }
        debug!("lan channel: {:?} -> {:?}", *state, new);
        *state = new.clone();
        drop(state);

        let _ = self.event_tx.send(ChannelEvent::StateChanged {
            kind: TransportKind::Lan,
            state: new,
        });
    }

    /// Get or create the mDNS daemon
    async fn ensure_daemon(&self) -> Result<ServiceDaemon> {
        let mut guard = self.daemon.write().await;
        if let Some(daemon) = guard.as_ref() {
            return Ok(daemon.clone());
        }

        let daemon = ServiceDaemon::new().map_err(map_mdns_error)?;
        *guard = Some(daemon.clone());
        Ok(daemon)
    }

    /// Spawn the browse loop translating mDNS events into channel events
    async fn spawn_browser(&self, browser: MdnsReceiver<ServiceEvent>) {
        let event_tx = self.event_tx.clone();
        let known = self.known_services.clone();
        let own_id = self.config.device_id.clone();

        let handle = tokio::spawn(async move {
            while let Ok(event) = browser.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let native_id = info
                            .get_property_val_str("id")
                            .unwrap_or_else(|| info.get_fullname())
                            .to_string();
                        if native_id == own_id {
                            continue;
                        }

                        let display_name = info
                            .get_property_val_str("name")
                            .map(str::to_string)
                            .unwrap_or_else(|| {
                                instance_from_fullname(info.get_fullname()).to_string()
                            });

                        let Some(ip) = info.get_addresses().iter().next().copied() else {
                            debug!("lan service {} resolved without address", info.get_fullname());
                            continue;
                        };
                        let addr = SocketAddr::new(ip, info.get_port());

                        known
                            .write()
                            .await
                            .insert(info.get_fullname().to_string(), native_id.clone());

                        info!("lan peer discovered: {} at {}", display_name, addr);
                        let _ = event_tx.send(ChannelEvent::PeerDiscovered(Peer::new(
                            TransportKind::Lan,
                            native_id,
                            display_name,
                            PeerAddress::Socket(addr),
                        )));
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        if let Some(native_id) = known.write().await.remove(&fullname) {
                            info!("lan peer lost: {}", native_id);
                            let _ = event_tx.send(ChannelEvent::PeerLost {
                                kind: TransportKind::Lan,
                                native_id,
                            });
                        }
                    }
                    other => debug!("lan browse event: {:?}", other),
                }
            }
        });

        self.tasks.write().await.push(handle);
    }

    /// Spawn the receiver datagram loop with synthesized session semantics
    async fn spawn_receive_loop(&self, socket: Arc<UdpSocket>) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let idle_timeout = self.config.idle_timeout;

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let mut active: Option<SocketAddr> = None;

            loop {
                let received = timeout(idle_timeout, socket.recv_from(&mut buf)).await;

                let (len, src) = match received {
                    Err(_) => {
                        // Idle gap: the synthesized session is over.
                        if active.take().is_some() {
                            *state.write().await = ChannelState::Discovering;
                            let _ = event_tx.send(ChannelEvent::Disconnected {
                                kind: TransportKind::Lan,
                                reason: Some("idle timeout".to_string()),
                            });
                            let _ = event_tx.send(ChannelEvent::StateChanged {
                                kind: TransportKind::Lan,
                                state: ChannelState::Discovering,
                            });
                        }
                        continue;
                    }
                    Ok(Err(e)) => {
                        error!("lan receive failed: {}", e);
                        break;
                    }
                    Ok(Ok(r)) => r,
                };

                match active {
                    None => {
                        active = Some(src);
                        *state.write().await = ChannelState::Connected;
                        info!("lan source connected: {}", src);
                        let _ = event_tx.send(ChannelEvent::StateChanged {
                            kind: TransportKind::Lan,
                            state: ChannelState::Connected,
                        });
                        let _ = event_tx.send(ChannelEvent::Connected {
                            kind: TransportKind::Lan,
                            remote: src.to_string(),
                        });
                    }
                    Some(current) if current != src => {
                        // One source per channel; extras are dropped here,
                        // the cross-channel rule lives in the arbitrator.
                        debug!("lan: dropping datagram from non-active source {}", src);
                        continue;
                    }
                    Some(_) => {}
                }

                let data = &buf[..len];
                if data.starts_with(LEGACY_PREFIX) {
                    for report in decode_legacy(data) {
                        let _ = event_tx.send(ChannelEvent::ReportReceived {
                            kind: TransportKind::Lan,
                            report,
                        });
                    }
                } else {
                    match MotionReport::decode(data, WireFormat::Hid) {
                        Ok(report) => {
                            let _ = event_tx.send(ChannelEvent::ReportReceived {
                                kind: TransportKind::Lan,
                                report,
                            });
                        }
                        Err(e) => debug!("dropping malformed lan datagram: {}", e),
                    }
                }
            }
        });

        self.tasks.write().await.push(handle);
    }

    /// Stop the channel entirely, aborting all background tasks
    pub async fn stop(&self) {
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }
        self.send_socket.write().await.take();
        if let Some(daemon) = self.daemon.write().await.take() {
            let _ = daemon.shutdown();
        }
        self.set_state(ChannelState::Stopped).await;
        info!("lan channel stopped");
    }
}

/// Extract the instance label from an mDNS fullname
fn instance_from_fullname(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

#[async_trait]
impl Channel for LanChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    async fn start_discovery(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("lan discovery already active ({:?})", current);
            return Ok(());
        }

        let daemon = self.ensure_daemon().await?;
        let browser = daemon.browse(LAN_SERVICE_TYPE).map_err(map_mdns_error)?;
        info!("lan browsing for {}", LAN_SERVICE_TYPE);

        self.spawn_browser(browser).await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn start_advertising(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("lan advertising already active ({:?})", current);
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding lan datagram socket"))?;
        let port = socket.local_addr().map_err(ProtocolError::Io)?.port();
        *self.local_port.write().await = Some(port);

        let daemon = self.ensure_daemon().await?;
        let service = ServiceInfo::new(
            LAN_SERVICE_TYPE,
            &self.config.device_name,
            &format!("{}.local.", self.config.device_id),
            "",
            port,
            &[
                ("id", self.config.device_id.as_str()),
                ("name", self.config.device_name.as_str()),
            ][..],
        )
        .map_err(map_mdns_error)?
        .enable_addr_auto();
        daemon.register(service).map_err(map_mdns_error)?;

        info!("lan advertising {} on UDP {}", LAN_SERVICE_TYPE, port);
        self.spawn_receive_loop(Arc::new(socket)).await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<()> {
        let addr = match &peer.address {
            PeerAddress::Socket(addr) => *addr,
            other => {
                return Err(ProtocolError::InvalidState(format!(
                    "lan cannot connect to {}",
                    other
                )))
            }
        };

        // Cold channel: kick discovery so the daemon exists, wait a bounded
        // delay, then proceed. The target address is already resolved, so a
        // discovery failure does not block the direct connect.
        if *self.state.read().await == ChannelState::Stopped {
            if let Err(e) = self.start_discovery().await {
                warn!("lan bootstrap discovery failed, connecting directly: {}", e);
            }
            tokio::time::sleep(self.config.bootstrap_delay).await;
        }

        self.set_state(ChannelState::Connecting).await;

        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                self.set_state(ChannelState::Discovering).await;
                return Err(ProtocolError::from_io_error(e, "binding lan send socket"));
            }
        };
        if let Err(e) = socket.connect(addr).await {
            // Never left half-connected: revert to browsing.
            self.set_state(ChannelState::Discovering).await;
            return Err(ProtocolError::from_io_error(e, "lan connect"));
        }

        *self.send_socket.write().await = Some(Arc::new(socket));
        self.set_state(ChannelState::Connected).await;
        let _ = self.event_tx.send(ChannelEvent::Connected {
            kind: TransportKind::Lan,
            remote: addr.to_string(),
        });
        info!("lan sending to {}", addr);
        Ok(())
    }

    async fn send(&self, report: &MotionReport) -> Result<()> {
        let socket = self
            .send_socket
            .read()
            .await
            .clone()
            .ok_or_else(|| ProtocolError::SendFailed("lan: no send target".to_string()))?;

        socket
            .send(&report.encode(WireFormat::Hid))
            .await
            .map_err(|e| ProtocolError::SendFailed(format!("lan send: {}", e)))?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let had_target = self.send_socket.write().await.take().is_some();

        if had_target {
            self.set_state(ChannelState::Discovering).await;
            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Lan,
                reason: None,
            });
            info!("lan send target cleared");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ButtonFlags;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(name: &str) -> LanChannelConfig {
        LanChannelConfig {
            device_name: name.to_string(),
            port: 0,
            idle_timeout: Duration::from_millis(300),
            bootstrap_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("Handheld._aeropoint._udp.local."),
            "Handheld"
        );
    }

    #[test]
    fn test_permission_sentinel_remap() {
        let e = mdns_sd::Error::Msg("socket permission denied by policy".to_string());
        assert!(matches!(map_mdns_error(e), ProtocolError::PermissionDenied(_)));

        let e = mdns_sd::Error::Msg("interface vanished".to_string());
        assert!(matches!(map_mdns_error(e), ProtocolError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_without_target_fails_as_send_failed() {
        let channel = LanChannel::new(test_config("a"));
        let report = MotionReport::new(ButtonFlags::default(), 2, 2, 0);
        assert!(matches!(
            channel.send(&report).await,
            Err(ProtocolError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_reverts_to_discovering() {
        let channel = LanChannel::new(test_config("a"));

        // The send socket binds v4, so a v6 target fails the connect.
        let peer = Peer::new(
            TransportKind::Lan,
            "x",
            "x",
            PeerAddress::Socket(SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 9)),
        );

        assert!(channel.connect(&peer).await.is_err());
        assert_eq!(channel.state().await, ChannelState::Discovering);

        channel.stop().await;
    }

    #[tokio::test]
    async fn test_datagram_loopback_binary_and_legacy() {
        let receiver = LanChannel::new(test_config("receiver"));

        // Drive only the datagram path; mDNS registration is exercised
        // separately since multicast is not available everywhere tests run.
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        *receiver.local_port.write().await = Some(port);
        receiver.spawn_receive_loop(Arc::new(socket)).await;
        receiver.set_state(ChannelState::Discovering).await;
        let mut events = receiver.subscribe().await;

        // First source: legacy text datagram with two concatenated commands.
        let legacy_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        legacy_socket
            .send_to(b"MOVE:3,4\nMOVE:5,6\n", ("127.0.0.1", port))
            .await
            .unwrap();

        let mut reports = Vec::new();
        let mut disconnects = 0;
        while reports.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::ReportReceived { report, .. }) => reports.push(report),
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }
        assert_eq!((reports[0].dx, reports[0].dy), (3, 4));
        assert_eq!((reports[1].dx, reports[1].dy), (5, 6));

        // Wait out the idle timeout so the synthesized session clears and a
        // second source may claim the channel.
        while disconnects == 0 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::Disconnected { .. }) => disconnects += 1,
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }

        let sender = LanChannel::new(test_config("sender"));
        let peer = Peer::new(
            TransportKind::Lan,
            "receiver",
            "receiver",
            PeerAddress::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        );
        sender.connect(&peer).await.unwrap();
        sender
            .send(&MotionReport::new(ButtonFlags::LEFT, 10, -5, 0))
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("receiver event")
            {
                Some(ChannelEvent::ReportReceived { report, .. }) => {
                    assert_eq!((report.dx, report.dy), (10, -5));
                    assert!(report.buttons.contains(ButtonFlags::LEFT));
                    break;
                }
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }

        receiver.stop().await;
        sender.stop().await;
    }
}
