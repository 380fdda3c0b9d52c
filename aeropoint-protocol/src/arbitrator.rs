//! Connection arbitration
//!
//! Two halves, one rule: at most one transport drives motion at a time.
//!
//! On the sender, [`SenderArbitrator`] owns all enabled channels, connects
//! only on the target peer's owning channel, and tears down any other
//! connected channel first so two transports never deliver the same
//! movement twice.
//!
//! On the receiver, [`ActiveSource`] tracks which channel currently holds
//! the input slot. The first channel to report a connected transition (or
//! to deliver a report while the slot is empty) claims it; every other
//! channel's reports are dropped until the owner disconnects.

use crate::transport::{Channel, ChannelEvent, ChannelState, Peer, TransportKind};
use crate::{MotionReport, ProtocolError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before the single automatic connect retry
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Sender-side channel selection and exclusivity
pub struct SenderArbitrator {
    channels: Vec<Arc<dyn Channel>>,
    retry_delay: Duration,
}

impl SenderArbitrator {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self {
            channels,
            retry_delay: CONNECT_RETRY_DELAY,
        }
    }

    /// Look up the channel owning a transport kind
    pub fn channel_for(&self, kind: TransportKind) -> Option<Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.kind() == kind).cloned()
    }

    /// The transport currently connected, if any
    pub async fn live_transport(&self) -> Option<TransportKind> {
        for channel in &self.channels {
            if channel.state().await == ChannelState::Connected {
                return Some(channel.kind());
            }
        }
        None
    }

    /// Connect to a peer on its owning channel, tearing down any other
    /// connected transport first. Retries once after a bounded delay if
    /// the first attempt fails recoverably; further retries are up to
    /// the caller.
    pub async fn connect_to(&self, peer: &Peer) -> Result<()> {
        let target = self.channel_for(peer.transport).ok_or_else(|| {
            ProtocolError::Unavailable(format!("transport {} not enabled", peer.transport))
        })?;

        for channel in &self.channels {
            if channel.kind() != peer.transport
                && channel.state().await == ChannelState::Connected
            {
                info!(
                    "arbitrator: disconnecting {} before connecting on {}",
                    channel.kind(),
                    peer.transport
                );
                if let Err(e) = channel.disconnect().await {
                    warn!("arbitrator: teardown of {} failed: {}", channel.kind(), e);
                }
            }
        }

        match target.connect(peer).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(
                    "arbitrator: connect to {} failed ({}), retrying once",
                    peer.id(),
                    e
                );
                tokio::time::sleep(self.retry_delay).await;
                target.connect(peer).await
            }
            Err(e) => Err(e),
        }
    }

    /// Route a report to the live transport. Drops the report with a log
    /// line if nothing is connected or the write fails; motion is never
    /// queued for later, replaying stale deltas would jump the cursor.
    pub async fn send(&self, report: &MotionReport) {
        for channel in &self.channels {
            if channel.state().await == ChannelState::Connected {
                if let Err(e) = channel.send(report).await {
                    warn!(
                        "arbitrator: send on {} failed, report dropped: {}",
                        channel.kind(),
                        e
                    );
                }
                return;
            }
        }
        debug!("arbitrator: dropping report, no live transport");
    }

    /// Tear down every connected channel
    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            if channel.state().await == ChannelState::Connected {
                if let Err(e) = channel.disconnect().await {
                    warn!("arbitrator: disconnect of {} failed: {}", channel.kind(), e);
                }
            }
        }
    }
}

/// Receiver-side active-source slot
///
/// Plain synchronous state so the claim/release rules are testable
/// without a runtime; callers wrap it in a mutex.
#[derive(Debug, Default)]
pub struct ActiveSource {
    owner: Option<TransportKind>,
}

impl ActiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport currently holding the slot
    pub fn owner(&self) -> Option<TransportKind> {
        self.owner
    }

    /// A channel reported a connected transition; it claims the slot if
    /// free. Returns whether the channel now holds the slot.
    pub fn on_connected(&mut self, kind: TransportKind) -> bool {
        match self.owner {
            None => {
                info!("active source claimed by {} (connected)", kind);
                self.owner = Some(kind);
                true
            }
            Some(owner) => owner == kind,
        }
    }

    /// A channel delivered a report. Claims the slot if free; returns
    /// whether the report should be accepted.
    pub fn on_report(&mut self, kind: TransportKind) -> bool {
        match self.owner {
            None => {
                info!("active source claimed by {} (first report)", kind);
                self.owner = Some(kind);
                true
            }
            Some(owner) => owner == kind,
        }
    }

    /// A channel disconnected; releases the slot only if it was the owner
    pub fn on_disconnected(&mut self, kind: TransportKind) -> bool {
        if self.owner == Some(kind) {
            info!("active source released by {}", kind);
            self.owner = None;
            true
        } else {
            false
        }
    }
}

/// Receiver-side event filter applying the active-source rule
///
/// Feed it every channel event; it returns the reports that are allowed
/// to reach the motion reconstructor.
pub struct ReceiverArbitrator {
    source: Arc<Mutex<ActiveSource>>,
}

impl Default for ReceiverArbitrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverArbitrator {
    pub fn new() -> Self {
        Self {
            source: Arc::new(Mutex::new(ActiveSource::new())),
        }
    }

    pub fn owner(&self) -> Option<TransportKind> {
        self.source.lock().unwrap().owner()
    }

    /// Apply one channel event. Returns `Some(report)` when the event is
    /// a report from the active source, `None` otherwise.
    pub fn handle(&self, event: &ChannelEvent) -> Option<MotionReport> {
        let mut source = self.source.lock().unwrap();
        match event {
            ChannelEvent::Connected { kind, .. } => {
                source.on_connected(*kind);
                None
            }
            ChannelEvent::Disconnected { kind, .. } => {
                source.on_disconnected(*kind);
                None
            }
            ChannelEvent::ReportReceived { kind, report } => {
                if source.on_report(*kind) {
                    Some(report.clone())
                } else {
                    debug!("dropping report from non-active source {}", kind);
                    None
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ButtonFlags;

    fn report(dx: i16, dy: i16) -> MotionReport {
        MotionReport::new(ButtonFlags::default(), dx, dy, 0)
    }

    fn report_event(kind: TransportKind, dx: i16, dy: i16) -> ChannelEvent {
        ChannelEvent::ReportReceived {
            kind,
            report: report(dx, dy),
        }
    }

    #[test]
    fn test_first_connected_claims_slot() {
        let mut source = ActiveSource::new();
        assert!(source.on_connected(TransportKind::Mesh));
        assert!(!source.on_connected(TransportKind::Lan));
        assert_eq!(source.owner(), Some(TransportKind::Mesh));
    }

    #[test]
    fn test_first_report_claims_empty_slot() {
        let mut source = ActiveSource::new();
        assert!(source.on_report(TransportKind::Lan));
        assert!(!source.on_report(TransportKind::Radio));
        assert!(source.on_report(TransportKind::Lan));
    }

    #[test]
    fn test_only_owner_releases() {
        let mut source = ActiveSource::new();
        source.on_connected(TransportKind::Mesh);

        assert!(!source.on_disconnected(TransportKind::Lan));
        assert_eq!(source.owner(), Some(TransportKind::Mesh));

        assert!(source.on_disconnected(TransportKind::Mesh));
        assert_eq!(source.owner(), None);

        // slot free again, next activity claims it
        assert!(source.on_report(TransportKind::Lan));
    }

    #[test]
    fn test_exclusivity_a_then_b() {
        let arbitrator = ReceiverArbitrator::new();

        arbitrator.handle(&ChannelEvent::Connected {
            kind: TransportKind::Mesh,
            remote: "a".to_string(),
        });
        arbitrator.handle(&ChannelEvent::Connected {
            kind: TransportKind::Lan,
            remote: "b".to_string(),
        });

        // only mesh reports pass while it holds the slot
        assert!(arbitrator
            .handle(&report_event(TransportKind::Mesh, 3, 4))
            .is_some());
        assert!(arbitrator
            .handle(&report_event(TransportKind::Lan, 9, 9))
            .is_none());

        arbitrator.handle(&ChannelEvent::Disconnected {
            kind: TransportKind::Mesh,
            reason: None,
        });

        // slot released; lan claims it with its next report
        let accepted = arbitrator.handle(&report_event(TransportKind::Lan, 5, 6));
        assert_eq!(accepted, Some(report(5, 6)));
        assert_eq!(arbitrator.owner(), Some(TransportKind::Lan));
    }

    #[test]
    fn test_non_report_events_pass_nothing() {
        let arbitrator = ReceiverArbitrator::new();
        assert!(arbitrator
            .handle(&ChannelEvent::StateChanged {
                kind: TransportKind::Mesh,
                state: ChannelState::Discovering,
            })
            .is_none());
        assert_eq!(arbitrator.owner(), None);
    }
}
