//! The injected event-log dependency
//!
//! The shared room event log is store-and-forward: events are eventually
//! delivered to every room member, including late joiners. The coordinator
//! never talks to a concrete backend; it receives a trait object at
//! construction.

use crate::signaling::RoomEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Receiving half of an event-log subscription.
///
/// Dropping the stream unsubscribes.
pub type EventStream = mpsc::Receiver<RoomEvent>;

/// Publish/subscribe interface over the shared room event log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Publish an event to the room log.
    ///
    /// Delivery is eventual; errors are transient write failures the caller
    /// may surface but should not treat as fatal.
    async fn publish(&self, event: RoomEvent) -> crate::Result<()>;

    /// Subscribe to events scoped to one session.
    ///
    /// Implementations deliver retained history first so late joiners
    /// converge, then live events in publication order.
    async fn subscribe(&self, session_id: &str) -> crate::Result<EventStream>;
}
