//! Transport channel abstraction
//!
//! Defines the common contract for the three concrete transports (mesh,
//! radio, lan) that can carry [`MotionReport`]s between the handheld sender
//! and the receiving host. Each channel is a small state machine:
//!
//! ```text
//! Stopped -> Discovering -> Connecting -> Connected -> (Stopped | Error)
//! ```
//!
//! with `Connected -> Stopped` on graceful disconnect. Channels own their
//! background I/O tasks and publish everything that happens through an
//! event stream, so callers never block on a connection attempt inline.

pub mod lan;
pub mod mesh;
pub mod radio;

use crate::{MotionReport, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use lan::{LanChannel, LanChannelConfig, LAN_SERVICE_TYPE};
pub use mesh::{MeshChannel, MeshChannelConfig, MESH_DISCOVERY_PORT};
pub use radio::{RadioChannel, RadioChannelConfig, RADIO_SERVICE_UUID};

/// Transport identifiers
///
/// The service name is a short, fixed, lowercase token used for discovery
/// filtering and registry key qualification. It must match exactly between
/// sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Short-range peer mesh: UDP identity broadcast plus a TCP session
    Mesh,

    /// Local radio: Bluetooth RFCOMM via BlueZ
    Radio,

    /// Local network: mDNS-SD discovery plus UDP datagrams
    Lan,
}

impl TransportKind {
    /// Short service name used in discovery filtering and peer ids
    pub fn service_name(&self) -> &'static str {
        match self {
            TransportKind::Mesh => "mesh",
            TransportKind::Radio => "radio",
            TransportKind::Lan => "lan",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Channel connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Not started
    Stopped,

    /// Advertising (receiver side) or browsing (sender side)
    Discovering,

    /// Connection attempt in flight
    Connecting,

    /// Session established
    Connected,

    /// Failed with a terminal reason
    Error(String),
}

/// Address of a remote endpoint, per transport family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// IP socket address (mesh TCP session, lan UDP datagrams)
    Socket(std::net::SocketAddr),

    /// Bluetooth device address
    Radio(String),
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddress::Socket(addr) => write!(f, "ip://{}", addr),
            PeerAddress::Radio(addr) => write!(f, "radio://{}", addr),
        }
    }
}

/// A peer discovered on one transport
///
/// The same physical host advertising on two transports yields two peers:
/// the user picks a transport, not just a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Transport this peer was discovered on
    pub transport: TransportKind,

    /// Transport-native identifier (service instance, device id, MAC)
    pub native_id: String,

    /// Human-readable name surfaced to the selection UI
    pub display_name: String,

    /// Where to connect
    pub address: PeerAddress,
}

impl Peer {
    pub fn new(
        transport: TransportKind,
        native_id: impl Into<String>,
        display_name: impl Into<String>,
        address: PeerAddress,
    ) -> Self {
        Self {
            transport,
            native_id: native_id.into(),
            display_name: display_name.into(),
            address,
        }
    }

    /// Transport-qualified id, unique across all channels
    pub fn id(&self) -> String {
        format!("{}-{}", self.transport.service_name(), self.native_id)
    }
}

/// Events published by a transport channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel entered a new state
    StateChanged {
        kind: TransportKind,
        state: ChannelState,
    },

    /// A peer appeared in discovery
    PeerDiscovered(Peer),

    /// A previously discovered peer went away
    PeerLost {
        kind: TransportKind,
        native_id: String,
    },

    /// A session was established
    Connected {
        kind: TransportKind,
        remote: String,
    },

    /// The session ended
    Disconnected {
        kind: TransportKind,
        reason: Option<String>,
    },

    /// A movement report arrived on this channel's session
    ReportReceived {
        kind: TransportKind,
        report: MotionReport,
    },

    /// A non-fatal error surfaced by the channel
    Error {
        kind: TransportKind,
        message: String,
    },
}

/// Common transport channel contract
///
/// All operations take `&self`; channels synchronize internally. Exactly
/// one session per channel: a second `connect` replaces the first.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Which transport this channel drives
    fn kind(&self) -> TransportKind;

    /// Current state
    async fn state(&self) -> ChannelState;

    /// Start browsing for peers (sender side)
    ///
    /// Idempotent when already discovering. Kicks the platform discovery
    /// primitive immediately rather than deferring it; some platforms tie
    /// their permission prompt to this call.
    async fn start_discovery(&self) -> Result<()>;

    /// Start advertising and accepting sessions (receiver side)
    ///
    /// Idempotent when already advertising.
    async fn start_advertising(&self) -> Result<()>;

    /// Begin connecting to a discovered peer
    ///
    /// If the channel has not been bootstrapped yet, discovery is started
    /// implicitly and the connect is retried once after a bounded delay.
    async fn connect(&self, peer: &Peer) -> Result<()>;

    /// Send one report on the active session
    ///
    /// Movement data is never queued or retried: a send with no session
    /// returns `SendFailed`, which callers log and drop. Replaying stale
    /// deltas after a stall would jump the cursor.
    async fn send(&self, report: &MotionReport) -> Result<()>;

    /// Tear down the session
    ///
    /// Sender-side background discovery keeps running so another target
    /// can be picked without restarting the browse.
    async fn disconnect(&self) -> Result<()>;

    /// Get a receiver for channel events
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent>;

    /// Check whether a session is established
    async fn is_connected(&self) -> bool {
        self.state().await == ChannelState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names_are_short_lowercase_tokens() {
        for kind in [TransportKind::Mesh, TransportKind::Radio, TransportKind::Lan] {
            let name = kind.service_name();
            assert!(!name.is_empty() && name.len() <= 8);
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_peer_qualified_id() {
        let peer = Peer::new(
            TransportKind::Lan,
            "host-42",
            "Living Room PC",
            PeerAddress::Socket("192.168.1.20:42711".parse().unwrap()),
        );
        assert_eq!(peer.id(), "lan-host-42");
    }

    #[test]
    fn test_peer_address_display() {
        let addr = PeerAddress::Socket("10.0.0.1:42711".parse().unwrap());
        assert_eq!(addr.to_string(), "ip://10.0.0.1:42711");

        let addr = PeerAddress::Radio("00:11:22:33:44:55".to_string());
        assert_eq!(addr.to_string(), "radio://00:11:22:33:44:55");
    }
}
