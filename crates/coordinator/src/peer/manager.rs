//! Peer link registry
//!
//! Tracks one link per remote participant and buffers signals that arrive
//! before their link exists. Offers and candidates can race ahead of the
//! join that triggers link creation; buffered signals are drained in
//! arrival order once the link is up.

use crate::peer::PeerLink;
use crate::signaling::Signal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// All peer links for one session
pub struct PeerLinkManager {
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    pending: RwLock<HashMap<String, Vec<Signal>>>,
    max_peers: usize,
}

impl PeerLinkManager {
    /// Create a manager bounded by the participant ceiling.
    ///
    /// The ceiling counts the local participant, so the mesh holds at most
    /// `max_participants - 1` links.
    pub fn new(max_participants: usize) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            max_peers: max_participants.saturating_sub(1),
        }
    }

    /// Register a new link, rejecting duplicates and mesh overflow
    pub async fn insert(&self, link: Arc<PeerLink>) -> crate::Result<()> {
        let mut links = self.links.write().await;

        if links.contains_key(link.peer_id()) {
            return Err(crate::Error::PeerConnectionError(format!(
                "Link already exists for {}",
                link.peer_id()
            )));
        }

        if links.len() >= self.max_peers {
            return Err(crate::Error::PeerConnectionError(format!(
                "Mesh is full ({} peers)",
                self.max_peers
            )));
        }

        info!(peer_id = %link.peer_id(), count = links.len() + 1, "peer link registered");
        links.insert(link.peer_id().to_string(), link);
        Ok(())
    }

    /// Look up the link for a peer
    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(peer_id).cloned()
    }

    /// Whether a link exists for the peer
    pub async fn contains(&self, peer_id: &str) -> bool {
        self.links.read().await.contains_key(peer_id)
    }

    /// All current links
    pub async fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().await.values().cloned().collect()
    }

    /// Number of active links
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    /// Whether the mesh has no links
    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Remove and close the link for a peer.
    ///
    /// Buffered signals for the peer are dropped too; anything queued for a
    /// departed peer is stale.
    pub async fn remove(&self, peer_id: &str) -> bool {
        self.pending.write().await.remove(peer_id);

        let link = self.links.write().await.remove(peer_id);
        match link {
            Some(link) => {
                link.close().await;
                debug!(peer_id, "peer link removed");
                true
            }
            None => false,
        }
    }

    /// Buffer a signal for a peer whose link does not exist yet
    pub async fn buffer_signal(&self, peer_id: &str, signal: Signal) {
        let mut pending = self.pending.write().await;
        let queue = pending.entry(peer_id.to_string()).or_default();
        debug!(peer_id, queued = queue.len() + 1, "signal buffered before link");
        queue.push(signal);
    }

    /// Take the buffered signals for a peer, in arrival order
    pub async fn drain_buffered(&self, peer_id: &str) -> Vec<Signal> {
        self.pending
            .write()
            .await
            .remove(peer_id)
            .unwrap_or_default()
    }

    /// Close every link and clear all buffers. Called once at teardown.
    pub async fn clear(&self) {
        self.pending.write().await.clear();

        let links: Vec<_> = self.links.write().await.drain().collect();
        for (peer_id, link) in links {
            link.close().await;
            debug!(peer_id, "peer link closed at teardown");
        }
    }
}
