//! In-memory event log
//!
//! Backs integration tests and single-process embeddings. Retains the full
//! history per session and replays it to new subscribers, matching the
//! store-and-forward contract of a real room log.

use crate::signaling::{EventLog, EventStream, RoomEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct SessionLog {
    history: Vec<RoomEvent>,
    subscribers: Vec<mpsc::Sender<RoomEvent>>,
}

/// Shared in-process event log
#[derive(Default)]
pub struct InMemoryEventLog {
    sessions: RwLock<HashMap<String, SessionLog>>,
}

impl InMemoryEventLog {
    /// Create an empty log
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of retained events for a session
    pub async fn history_len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|log| log.history.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(&self, event: RoomEvent) -> crate::Result<()> {
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(event.session_id().to_string()).or_default();

        log.history.push(event.clone());

        // No awaits while the lock is held: a stalled subscriber must not
        // wedge every other publisher and subscriber in the process.
        // try_send drops the subscriber on a full buffer as well as on a
        // closed receiver; a reader that far behind will not catch up.
        log.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = event.session_id(), "dropping closed subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = event.session_id(), "dropping stalled subscriber");
                false
            }
        });

        Ok(())
    }

    async fn subscribe(&self, session_id: &str) -> crate::Result<EventStream> {
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session_id.to_string()).or_default();

        // The channel is sized to take the full replay without blocking, so
        // history fits via try_send and the lock is never held across an
        // await here either.
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER + log.history.len());
        for event in &log.history {
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }

        log.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{Signal, SignalKind};

    fn join_signal(session_id: &str, from: &str) -> RoomEvent {
        RoomEvent::Signal(Signal::broadcast(
            session_id,
            from,
            SignalKind::Join,
            serde_json::json!({}),
        ))
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let log = InMemoryEventLog::new();
        let mut rx = log.subscribe("s1").await.unwrap();

        log.publish(join_signal("s1", "@alice:example.org")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
    }

    #[tokio::test]
    async fn test_history_replayed_to_late_joiner() {
        let log = InMemoryEventLog::new();
        log.publish(join_signal("s1", "@alice:example.org")).await.unwrap();
        log.publish(join_signal("s1", "@bob:example.org")).await.unwrap();

        let mut rx = log.subscribe("s1").await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert_eq!(log.history_len("s1").await, 2);
    }

    #[tokio::test]
    async fn test_sessions_isolated() {
        let log = InMemoryEventLog::new();
        let mut other = log.subscribe("s2").await.unwrap();

        log.publish(join_signal("s1", "@alice:example.org")).await.unwrap();

        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let log = InMemoryEventLog::new();
        let rx = log.subscribe("s1").await.unwrap();
        drop(rx);

        log.publish(join_signal("s1", "@alice:example.org")).await.unwrap();
        log.publish(join_signal("s1", "@bob:example.org")).await.unwrap();
        assert_eq!(log.history_len("s1").await, 2);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_publishers() {
        let log = InMemoryEventLog::new();
        // Subscribed but never read
        let _stalled = log.subscribe("s1").await.unwrap();

        let flood = async {
            for _ in 0..(SUBSCRIBER_BUFFER + 8) {
                log.publish(join_signal("s1", "@alice:example.org")).await.unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), flood)
            .await
            .expect("publish must not wait on a full subscriber buffer");

        // Other sessions stay reachable too
        let mut other = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            log.subscribe("s2"),
        )
        .await
        .expect("subscribe must not wait on a full subscriber buffer")
        .unwrap();
        log.publish(join_signal("s2", "@bob:example.org")).await.unwrap();
        assert!(other.recv().await.is_some());
    }
}
