//! Radio transport channel
//!
//! Local-radio transport over Bluetooth RFCOMM, using BlueZ on Linux via
//! the bluer crate. RFCOMM gives a stream-style serial session, so reports
//! travel in the fixed 5-byte compact form like the mesh channel.
//!
//! ## Connection flow
//!
//! 1. Receiver binds an RFCOMM listener on a fixed channel
//! 2. Sender discovers nearby devices through the adapter event stream
//! 3. Sender connects to the chosen device's RFCOMM channel
//! 4. Compact movement frames flow sender -> receiver
//!
//! A fixed channel keeps the code free of SDP registration; both ends of
//! the system agree on the channel the same way they agree on the service
//! name.

use crate::transport::{
    Channel, ChannelEvent, ChannelState, Peer, PeerAddress, TransportKind,
};
use crate::{MotionReport, PacketClass, ProtocolError, Result, WireFormat, MIN_REPORT_LEN};
use async_trait::async_trait;
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// AeroPoint radio service UUID (documented for SDP-capable peers)
pub const RADIO_SERVICE_UUID: Uuid = uuid::uuid!("6f4a2b1c-8d3e-44f5-9a07-21c6e8b5d430");

/// Fixed RFCOMM channel for movement sessions
pub const RADIO_RFCOMM_CHANNEL: u8 = 3;

/// Radio channel configuration
#[derive(Debug, Clone)]
pub struct RadioChannelConfig {
    /// RFCOMM channel both ends agree on
    pub rfcomm_channel: u8,

    /// Delay before retrying a connect issued against a cold channel
    pub bootstrap_delay: Duration,

    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for RadioChannelConfig {
    fn default() -> Self {
        Self {
            rfcomm_channel: RADIO_RFCOMM_CHANNEL,
            bootstrap_delay: Duration::from_millis(800),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Remap BlueZ errors into the channel error taxonomy
fn map_bluer_error(e: bluer::Error, context: &str) -> ProtocolError {
    classify_radio_fault(&e.to_string(), context)
}

/// BlueZ reports faults as text, so classification goes by message
fn classify_radio_fault(text: &str, context: &str) -> ProtocolError {
    let lowered = text.to_lowercase();
    if lowered.contains("not authorized") || lowered.contains("permission") {
        ProtocolError::PermissionDenied(format!("{}: {}", context, text))
    } else if lowered.contains("not ready")
        || lowered.contains("powered")
        || lowered.contains("no such adapter")
        || lowered.contains("not available")
    {
        ProtocolError::Unavailable(format!("{}: {}", context, text))
    } else {
        ProtocolError::Transport(format!("{}: {}", context, text))
    }
}

/// Radio transport channel
pub struct RadioChannel {
    config: RadioChannelConfig,

    /// Connection state
    state: Arc<RwLock<ChannelState>>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<ChannelEvent>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<ChannelEvent>>>,

    /// BlueZ session, created on first use
    session: Arc<RwLock<Option<Session>>>,

    /// Write half of the active RFCOMM session (sender side)
    writer: Arc<RwLock<Option<WriteHalf<Stream>>>>,

    /// Background tasks
    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl RadioChannel {
    /// Create a new radio channel
    pub fn new(config: RadioChannelConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Arc::new(RwLock::new(ChannelState::Stopped)),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            session: Arc::new(RwLock::new(None)),
            writer: Arc::new(RwLock::new(None)),
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a radio channel with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RadioChannelConfig::default())
    }

    async fn set_state(&self, new: ChannelState) {
        let mut state = self.state.write().await;
        if *state == new {
            return;
        }
        debug!("radio channel: {:?} -> {:?}", *state, new);
        *state = new.clone();
        drop(state);

        let _ = self.event_tx.send(ChannelEvent::StateChanged {
            kind: TransportKind::Radio,
            state: new,
        });
    }

    /// Get or create the BlueZ session and powered default adapter
    async fn ensure_adapter(&self) -> Result<Adapter> {
        let mut guard = self.session.write().await;
        let session = match guard.as_ref() {
            Some(session) => session.clone(),
            None => {
                let session = Session::new()
                    .await
                    .map_err(|e| map_bluer_error(e, "opening bluetooth session"))?;
                *guard = Some(session.clone());
                session
            }
        };
        drop(guard);

        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| map_bluer_error(e, "getting bluetooth adapter"))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| map_bluer_error(e, "powering bluetooth adapter"))?;
        Ok(adapter)
    }

    /// Spawn the adapter event loop translating discovery into peers
    async fn spawn_device_discovery(&self, adapter: Adapter) {
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.discover_devices().await {
                Ok(events) => events,
                Err(e) => {
                    error!("radio discovery failed to start: {}", e);
                    let _ = event_tx.send(ChannelEvent::Error {
                        kind: TransportKind::Radio,
                        message: map_bluer_error(e, "starting discovery").to_string(),
                    });
                    return;
                }
            };

            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) => {
                        let display_name = match adapter.device(addr) {
                            Ok(device) => device
                                .alias()
                                .await
                                .unwrap_or_else(|_| addr.to_string()),
                            Err(_) => addr.to_string(),
                        };

                        info!("radio peer discovered: {} ({})", display_name, addr);
                        let _ = event_tx.send(ChannelEvent::PeerDiscovered(Peer::new(
                            TransportKind::Radio,
                            addr.to_string(),
                            display_name,
                            PeerAddress::Radio(addr.to_string()),
                        )));
                    }
                    AdapterEvent::DeviceRemoved(addr) => {
                        info!("radio peer lost: {}", addr);
                        let _ = event_tx.send(ChannelEvent::PeerLost {
                            kind: TransportKind::Radio,
                            native_id: addr.to_string(),
                        });
                    }
                    AdapterEvent::PropertyChanged(_) => {}
                }
            }
        });

        self.tasks.write().await.push(handle);
    }

    /// Spawn the RFCOMM accept loop (receiver side)
    async fn spawn_accept_loop(&self, listener: Listener) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("radio accept failed: {}", e);
                        break;
                    }
                };

                if *state.read().await == ChannelState::Connected {
                    warn!("radio: refusing second session from {}", remote.addr);
                    drop(stream);
                    continue;
                }

                info!("radio session accepted from {}", remote.addr);
                *state.write().await = ChannelState::Connected;
                let _ = event_tx.send(ChannelEvent::StateChanged {
                    kind: TransportKind::Radio,
                    state: ChannelState::Connected,
                });
                let _ = event_tx.send(ChannelEvent::Connected {
                    kind: TransportKind::Radio,
                    remote: remote.addr.to_string(),
                });

                Self::read_session(stream, &event_tx).await;

                *state.write().await = ChannelState::Discovering;
                let _ = event_tx.send(ChannelEvent::StateChanged {
                    kind: TransportKind::Radio,
                    state: ChannelState::Discovering,
                });
            }
        });

        self.tasks.write().await.push(handle);
    }

    /// Read compact-form frames off an RFCOMM session until it ends
    async fn read_session(mut stream: Stream, event_tx: &mpsc::UnboundedSender<ChannelEvent>) {
        let mut frame = [0u8; MIN_REPORT_LEN];

        loop {
            match stream.read_exact(&mut frame).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("radio session closed by peer");
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Radio,
                        reason: None,
                    });
                    return;
                }
                Err(e) => {
                    warn!("radio session read failed: {}", e);
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Radio,
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
                                kind: TransportKind::Radio,
                                report,
                            });
                        }
                        Err(e) => debug!("dropping malformed radio report: {}", e),
                    }
                }
                Ok(PacketClass::Control) => debug!("radio control frame ignored"),
                Err(e) => {
                    warn!("radio framing lost ({}), dropping session", e);
                    let _ = event_tx.send(ChannelEvent::Disconnected {
                        kind: TransportKind::Radio,
                        reason: Some("framing lost".to_string()),
                    });
                    return;
                }
            }
        }
    }

    /// Watch the sender-side session for remote close
    async fn spawn_session_watcher(&self, mut read_half: tokio::io::ReadHalf<Stream>) {
        let state = self.state.clone();
        let writer = self.writer.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut sink = [0u8; 64];
            let reason = loop {
                match read_half.read(&mut sink).await {
                    Ok(0) => break None,
                    Ok(_) => continue,
                    Err(e) => break Some(e.to_string()),
                }
            };

            writer.write().await.take();
            *state.write().await = ChannelState::Discovering;
            let _ = event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Radio,
                reason,
            });
            let _ = event_tx.send(ChannelEvent::StateChanged {
                kind: TransportKind::Radio,
                state: ChannelState::Discovering,
            });
        });

        self.tasks.write().await.push(handle);
    }

    /// Stop the channel entirely, aborting all background tasks
    pub async fn stop(&self) {
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }
        self.writer.write().await.take();
        self.session.write().await.take();
        self.set_state(ChannelState::Stopped).await;
        info!("radio channel stopped");
    }
}

#[async_trait]
impl Channel for RadioChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    async fn state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    async fn start_discovery(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("radio discovery already active ({:?})", current);
            return Ok(());
        }

        let adapter = self.ensure_adapter().await?;
        info!("radio discovery starting on adapter {}", adapter.name());

        self.spawn_device_discovery(adapter).await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn start_advertising(&self) -> Result<()> {
        let current = self.state.read().await.clone();
        if current != ChannelState::Stopped {
            debug!("radio advertising already active ({:?})", current);
            return Ok(());
        }

        // Adapter must be powered and discoverable for peers to find us.
        let adapter = self.ensure_adapter().await?;
        if let Err(e) = adapter.set_discoverable(true).await {
            warn!("radio: could not set adapter discoverable: {}", e);
        }

        let listener = Listener::bind(SocketAddr::new(
            Address::any(),
            self.config.rfcomm_channel,
        ))
        .await
        .map_err(|e| map_bluer_error(e.into(), "binding rfcomm listener"))?;

        info!(
            "radio advertising on rfcomm channel {}",
            self.config.rfcomm_channel
        );
        self.spawn_accept_loop(listener).await;
        self.set_state(ChannelState::Discovering).await;
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<()> {
        let address = match &peer.address {
            PeerAddress::Radio(addr) => addr.clone(),
            other => {
                return Err(ProtocolError::InvalidState(format!(
                    "radio cannot connect to {}",
                    other
                )))
            }
        };

        let bt_addr = Address::from_str(&address).map_err(|e| {
            ProtocolError::InvalidState(format!("invalid bluetooth address '{}': {}", address, e))
        })?;

        // Cold channel: the adapter needs a moment after power-on before it
        // will take a connect, so bootstrap discovery and wait briefly.
        if *self.state.read().await == ChannelState::Stopped {
            if let Err(e) = self.start_discovery().await {
                warn!("radio bootstrap discovery failed, connecting directly: {}", e);
            }
            tokio::time::sleep(self.config.bootstrap_delay).await;
        }

        self.set_state(ChannelState::Connecting).await;
        let target = SocketAddr::new(bt_addr, self.config.rfcomm_channel);
        info!("radio connecting to {}", address);

        let stream = match timeout(self.config.connect_timeout, Stream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ChannelState::Discovering).await;
                return Err(map_bluer_error(e.into(), "radio connect"));
            }
            Err(_) => {
                self.set_state(ChannelState::Discovering).await;
                return Err(ProtocolError::Timeout(format!(
                    "radio connect to {} exceeded {:?}",
                    address, self.config.connect_timeout
                )));
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.write().await = Some(write_half);
        self.spawn_session_watcher(read_half).await;

        self.set_state(ChannelState::Connected).await;
        let _ = self.event_tx.send(ChannelEvent::Connected {
            kind: TransportKind::Radio,
            remote: address.clone(),
        });
        info!("radio connected to {}", address);
        Ok(())
    }

    async fn send(&self, report: &MotionReport) -> Result<()> {
        let mut writer = self.writer.write().await;
        let stream = writer.as_mut().ok_or_else(|| {
            ProtocolError::SendFailed("radio: no active session".to_string())
        })?;

        let bytes = report.encode(WireFormat::Compact);
        if let Err(e) = stream.write_all(&bytes).await {
            writer.take();
            drop(writer);
            self.set_state(ChannelState::Discovering).await;
            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Radio,
                reason: Some(e.to_string()),
            });
            return Err(ProtocolError::SendFailed(format!("radio write: {}", e)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let had_session = self.writer.write().await.take().is_some();

        if had_session {
            self.set_state(ChannelState::Discovering).await;
            let _ = self.event_tx.send(ChannelEvent::Disconnected {
                kind: TransportKind::Radio,
                reason: None,
            });
            info!("radio session disconnected");
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

    #[test]
    fn test_default_config() {
        let config = RadioChannelConfig::default();
        assert_eq!(config.rfcomm_channel, RADIO_RFCOMM_CHANNEL);
        assert!(config.bootstrap_delay <= Duration::from_secs(1));
    }

    #[test]
    fn test_fault_classification() {
        assert!(matches!(
            classify_radio_fault("Operation not authorized", "connect"),
            ProtocolError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_radio_fault("adapter not ready", "connect"),
            ProtocolError::Unavailable(_)
        ));
        assert!(matches!(
            classify_radio_fault("page timeout", "connect"),
            ProtocolError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_initial_state_and_send_without_session() {
        let channel = RadioChannel::with_defaults();
        assert_eq!(channel.state().await, ChannelState::Stopped);

        let report = MotionReport::new(ButtonFlags::default(), 1, 0, 0);
        assert!(matches!(
            channel.send(&report).await,
            Err(ProtocolError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_socket_address() {
        let channel = RadioChannel::with_defaults();
        let peer = Peer::new(
            TransportKind::Radio,
            "x",
            "x",
            PeerAddress::Socket("127.0.0.1:1".parse().unwrap()),
        );
        assert!(matches!(
            channel.connect(&peer).await,
            Err(ProtocolError::InvalidState(_))
        ));
    }
}
