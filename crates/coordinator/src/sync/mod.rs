//! Session synchronizer
//!
//! Keeps two independent representations of session state converging after
//! every meaningful mutation: a durable snapshot published to the shared
//! event log, and a `participants-sync` broadcast over every open control
//! channel. Consumers treat both paths as idempotent last-value-wins
//! updates, so no ordering between them is required.
//!
//! High-frequency triggers (remote track arrival) go through the debounced
//! path; explicit user actions sync immediately.

use crate::channels::ControlMessage;
use crate::participant::ParticipantRegistry;
use crate::peer::PeerLinkManager;
use crate::session::SessionMetadata;
use crate::signaling::{EventLog, ParticipantsSnapshot, RoomEvent, StateSnapshot};
use crate::stage::derive_stage;
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Outcome of a control broadcast across the mesh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Peers the message was sent to
    pub sent: usize,

    /// Peers the send failed for
    pub failed: usize,

    /// User ids of the peers that failed
    pub failed_peers: Vec<String>,
}

impl BroadcastStats {
    /// Whether every open channel accepted the message
    pub fn all_sent(&self) -> bool {
        self.failed == 0
    }
}

/// Publishes registry and stage snapshots through both sync paths
pub struct SessionSynchronizer {
    event_log: Arc<dyn EventLog>,
    session_id: String,
    registry: Arc<RwLock<ParticipantRegistry>>,
    metadata: Arc<RwLock<SessionMetadata>>,
    peers: Arc<PeerLinkManager>,
    debounce: Duration,
    sync_pending: AtomicBool,
}

impl SessionSynchronizer {
    /// Create a synchronizer over the shared session state
    pub fn new(
        event_log: Arc<dyn EventLog>,
        session_id: impl Into<String>,
        registry: Arc<RwLock<ParticipantRegistry>>,
        metadata: Arc<RwLock<SessionMetadata>>,
        peers: Arc<PeerLinkManager>,
        debounce_ms: u64,
    ) -> Self {
        Self {
            event_log,
            session_id: session_id.into(),
            registry,
            metadata,
            peers,
            debounce: Duration::from_millis(debounce_ms),
            sync_pending: AtomicBool::new(false),
        }
    }

    /// Local participant id, read from the registry
    async fn local_id(&self) -> String {
        self.registry.read().await.local_id().to_string()
    }

    /// Broadcast a control message to every open channel and mirror it
    /// through the event log.
    ///
    /// Per-peer send failures are collected, not propagated; a peer whose
    /// channel is still opening converges via the log mirror instead.
    pub async fn broadcast_control(&self, message: ControlMessage) -> BroadcastStats {
        let mut stats = BroadcastStats::default();

        let links = self.peers.links().await;
        let sends = links.iter().map(|link| {
            let message = &message;
            async move { (link.peer_id().to_string(), link.send_control(message).await) }
        });
        for (peer_id, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => stats.sent += 1,
                Err(e) => {
                    debug!(peer_id = %peer_id, "control send skipped: {}", e);
                    stats.failed += 1;
                    stats.failed_peers.push(peer_id);
                }
            }
        }

        let mirror = RoomEvent::Control {
            session_id: self.session_id.clone(),
            from: self.local_id().await,
            message,
        };
        if let Err(e) = self.event_log.publish(mirror).await {
            warn!("Failed to mirror control message to event log: {}", e);
        }

        debug!(sent = stats.sent, failed = stats.failed, "control broadcast");
        stats
    }

    /// Publish a registry snapshot and broadcast `participants-sync` now
    pub async fn sync_participants(&self) -> crate::Result<BroadcastStats> {
        let participants = self.registry.read().await.participants();
        let updated_at = Utc::now();

        let snapshot = RoomEvent::Participants(ParticipantsSnapshot {
            session_id: self.session_id.clone(),
            from: self.local_id().await,
            participants: participants.clone(),
            updated_at,
        });
        self.event_log.publish(snapshot).await?;

        let stats = self
            .broadcast_control(ControlMessage::ParticipantsSync {
                participants,
                updated_at,
            })
            .await;
        Ok(stats)
    }

    /// Publish a full session + stage snapshot to the event log
    pub async fn publish_state(&self) -> crate::Result<()> {
        let (participants, stage) = {
            let registry = self.registry.read().await;
            (registry.participants(), derive_stage(&registry))
        };
        let metadata = self.metadata.read().await.clone();

        self.event_log
            .publish(RoomEvent::State(StateSnapshot {
                session_id: self.session_id.clone(),
                from: self.local_id().await,
                started_by: metadata.started_by,
                started_at: metadata.started_at,
                kind: metadata.kind,
                participants,
                co_watch: metadata.co_watch,
                stage,
            }))
            .await
    }

    /// Debounced registry sync for high-frequency triggers.
    ///
    /// Calls within the debounce window coalesce into one sync; failures on
    /// the deferred path are logged and retried by the next mutation.
    pub fn schedule_sync(self: Arc<Self>) {
        if self
            .sync_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tokio::spawn(async move {
            tokio::time::sleep(self.debounce).await;
            self.sync_pending.store(false, Ordering::SeqCst);
            if let Err(e) = self.sync_participants().await {
                warn!("Deferred participant sync failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{Participant, Role};
    use crate::signaling::InMemoryEventLog;

    fn harness() -> (Arc<SessionSynchronizer>, Arc<InMemoryEventLog>) {
        let log = InMemoryEventLog::new();
        let registry = Arc::new(RwLock::new(ParticipantRegistry::new(Participant::new(
            "@alice:example.org",
            "Alice",
            Role::Host,
        ))));
        let metadata = Arc::new(RwLock::new(SessionMetadata::new(
            "@alice:example.org",
            "mesh-call",
        )));
        let peers = Arc::new(PeerLinkManager::new(4));
        let sync = Arc::new(SessionSynchronizer::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            "!room:example.org",
            registry,
            metadata,
            peers,
            50,
        ));
        (sync, log)
    }

    #[tokio::test]
    async fn test_sync_publishes_snapshot_and_mirror() {
        let (sync, log) = harness();
        let stats = sync.sync_participants().await.unwrap();
        assert!(stats.all_sent());

        // One participants event plus the control mirror
        assert_eq!(log.history_len("!room:example.org").await, 2);
    }

    #[tokio::test]
    async fn test_publish_state_carries_stage() {
        let (sync, log) = harness();
        sync.publish_state().await.unwrap();

        let mut stream = log.subscribe("!room:example.org").await.unwrap();
        match stream.recv().await.unwrap() {
            RoomEvent::State(state) => {
                assert_eq!(state.from, "@alice:example.org");
                assert_eq!(state.started_by, "@alice:example.org");
                assert_eq!(state.kind, "mesh-call");
                assert_eq!(state.stage.speakers, vec!["@alice:example.org"]);
            }
            other => panic!("expected state event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_schedule_sync_coalesces() {
        let (sync, log) = harness();

        sync.clone().schedule_sync();
        sync.clone().schedule_sync();
        sync.clone().schedule_sync();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Three schedules within the window produce one sync (two events)
        assert_eq!(log.history_len("!room:example.org").await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let (sync, _log) = harness();
        let stats = sync
            .broadcast_control(ControlMessage::HandLower {
                user_id: "@bob:example.org".to_string(),
            })
            .await;
        assert_eq!(stats.sent, 0);
        assert!(stats.all_sent());
    }
}
