//! Discovery registry
//!
//! Aggregates peers discovered across all transport channels into one
//! queryable view. Each entry is keyed by the qualified peer id
//! (`<transport>-<native id>`), so the same physical device seen on two
//! transports appears twice; picking between those entries is the
//! caller's decision, not the registry's.

use crate::transport::{ChannelEvent, Peer, TransportKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Registry change notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A peer appeared that was not known before
    PeerAdded(Peer),
    /// A known peer's name or address changed
    PeerUpdated(Peer),
    /// A peer disappeared from its transport
    PeerRemoved { id: String },
}

/// Aggregated view of discovered peers across transports
pub struct DiscoveryRegistry {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<RegistryEvent>>>,
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        }
    }

    /// Insert or refresh a peer. Returns true if the peer was new.
    pub async fn upsert(&self, peer: Peer) -> bool {
        let id = peer.id();
        let mut peers = self.peers.write().await;

        match peers.insert(id.clone(), peer.clone()) {
            None => {
                info!("registry: peer added: {} ({})", peer.display_name, id);
                drop(peers);
                let _ = self.event_tx.send(RegistryEvent::PeerAdded(peer));
                true
            }
            Some(previous) => {
                if previous.display_name != peer.display_name
                    || previous.address != peer.address
                {
                    debug!("registry: peer updated: {}", id);
                    drop(peers);
                    let _ = self.event_tx.send(RegistryEvent::PeerUpdated(peer));
                }
                false
            }
        }
    }

    /// Remove a peer by transport and native id
    pub async fn remove(&self, transport: TransportKind, native_id: &str) -> Option<Peer> {
        let id = format!("{}-{}", transport.service_name(), native_id);
        let removed = self.peers.write().await.remove(&id);

        if removed.is_some() {
            info!("registry: peer removed: {}", id);
            let _ = self.event_tx.send(RegistryEvent::PeerRemoved { id });
        }
        removed
    }

    /// Look up a peer by qualified id
    pub async fn get(&self, id: &str) -> Option<Peer> {
        self.peers.read().await.get(id).cloned()
    }

    /// All known peers, sorted by qualified id for stable listing
    pub async fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id().cmp(&b.id()));
        peers
    }

    /// Drop every peer belonging to one transport, e.g. when its channel stops
    pub async fn clear_transport(&self, transport: TransportKind) {
        let mut peers = self.peers.write().await;
        let gone: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.transport == transport)
            .map(|(id, _)| id.clone())
            .collect();

        for id in gone {
            peers.remove(&id);
            let _ = self.event_tx.send(RegistryEvent::PeerRemoved { id });
        }
    }

    /// Feed a channel event into the registry; ignores non-discovery events
    pub async fn apply(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::PeerDiscovered(peer) => {
                self.upsert(peer.clone()).await;
            }
            ChannelEvent::PeerLost { kind, native_id } => {
                self.remove(*kind, native_id).await;
            }
            _ => {}
        }
    }

    /// Subscribe to registry change events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
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
    use crate::transport::PeerAddress;

    fn lan_peer(native_id: &str, name: &str) -> Peer {
        Peer::new(
            TransportKind::Lan,
            native_id,
            name,
            PeerAddress::Socket("127.0.0.1:42712".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_update() {
        let registry = DiscoveryRegistry::new();

        assert!(registry.upsert(lan_peer("host-1", "Study Laptop")).await);
        assert!(!registry.upsert(lan_peer("host-1", "Study Laptop")).await);
        assert!(!registry.upsert(lan_peer("host-1", "Renamed")).await);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].display_name, "Renamed");
    }

    #[tokio::test]
    async fn test_no_cross_transport_dedup() {
        let registry = DiscoveryRegistry::new();

        registry.upsert(lan_peer("aa:bb", "Tablet")).await;
        registry
            .upsert(Peer::new(
                TransportKind::Radio,
                "aa:bb",
                "Tablet",
                PeerAddress::Radio("AA:BB:CC:DD:EE:FF".to_string()),
            ))
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id(), "lan-aa:bb");
        assert_eq!(snapshot[1].id(), "radio-aa:bb");
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let registry = DiscoveryRegistry::new();
        registry.upsert(lan_peer("a", "A")).await;
        registry.upsert(lan_peer("b", "B")).await;

        assert!(registry.remove(TransportKind::Lan, "a").await.is_some());
        assert!(registry.remove(TransportKind::Lan, "a").await.is_none());
        assert_eq!(registry.snapshot().await.len(), 1);

        registry.clear_transport(TransportKind::Lan).await;
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_channel_events() {
        let registry = DiscoveryRegistry::new();
        let mut events = registry.subscribe().await;

        registry
            .apply(&ChannelEvent::PeerDiscovered(lan_peer("x", "X")))
            .await;
        assert!(registry.get("lan-x").await.is_some());
        assert!(matches!(
            events.recv().await,
            Some(RegistryEvent::PeerAdded(_))
        ));

        registry
            .apply(&ChannelEvent::PeerLost {
                kind: TransportKind::Lan,
                native_id: "x".to_string(),
            })
            .await;
        assert!(registry.get("lan-x").await.is_none());
        assert!(matches!(
            events.recv().await,
            Some(RegistryEvent::PeerRemoved { .. })
        ));
    }
}
