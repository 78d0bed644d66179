//! Session metadata and co-watch state
//!
//! Session metadata is mutated by the local participant only, but accepted
//! from any peer's published state. Conflicts are resolved last-write-wins
//! with an explicit tie-break: the descriptor with the highest `started_at`
//! wins, ties keep the local value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared-viewing descriptor layered on top of the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoWatchState {
    /// Whether a co-watch is currently running
    pub active: bool,

    /// Media URL being watched (present while active)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Participant who toggled this state
    pub started_by: String,

    /// When this state was produced; also the LWW conflict key
    pub started_at: DateTime<Utc>,
}

/// Session-level metadata published in `state` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Participant that started the session
    pub started_by: String,

    /// Session start time; the earliest observed value wins across clients
    pub started_at: DateTime<Utc>,

    /// Topology identifier
    pub kind: String,

    /// Co-watch descriptor, if any toggle has happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co_watch: Option<CoWatchState>,
}

impl SessionMetadata {
    /// Metadata for a freshly created session
    pub fn new(started_by: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            started_by: started_by.into(),
            started_at: Utc::now(),
            kind: kind.into(),
            co_watch: None,
        }
    }

    /// Adopt session origin from a remote `state` event.
    ///
    /// Every client stamps itself as starter at creation; the true session
    /// start is the earliest stamp any client observed. Returns true if the
    /// origin changed.
    pub fn adopt_origin(&mut self, started_by: &str, started_at: DateTime<Utc>, kind: &str) -> bool {
        if started_at < self.started_at {
            self.started_by = started_by.to_string();
            self.started_at = started_at;
            self.kind = kind.to_string();
            true
        } else {
            false
        }
    }

    /// Merge an incoming co-watch descriptor, last-write-wins.
    ///
    /// A strictly newer `started_at` replaces the current descriptor; equal
    /// or older stamps keep the local value. Returns true if the descriptor
    /// changed.
    pub fn merge_co_watch(&mut self, incoming: CoWatchState) -> bool {
        let newer = match &self.co_watch {
            Some(current) => incoming.started_at > current.started_at,
            None => true,
        };
        if newer && self.co_watch.as_ref() != Some(&incoming) {
            self.co_watch = Some(incoming);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn co_watch(started_by: &str, offset_ms: i64) -> CoWatchState {
        CoWatchState {
            active: true,
            url: Some("https://example.org/stream".to_string()),
            started_by: started_by.to_string(),
            started_at: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_merge_newer_wins() {
        let mut meta = SessionMetadata::new("@alice:example.org", "mesh-call");
        assert!(meta.merge_co_watch(co_watch("@alice:example.org", -100)));
        let newer = co_watch("@bob:example.org", 100);
        assert!(meta.merge_co_watch(newer.clone()));
        assert_eq!(meta.co_watch, Some(newer));
    }

    #[test]
    fn test_merge_older_loses() {
        let mut meta = SessionMetadata::new("@alice:example.org", "mesh-call");
        let current = co_watch("@alice:example.org", 0);
        meta.merge_co_watch(current.clone());
        assert!(!meta.merge_co_watch(co_watch("@bob:example.org", -500)));
        assert_eq!(meta.co_watch, Some(current));
    }

    #[test]
    fn test_merge_tie_keeps_local() {
        let mut meta = SessionMetadata::new("@alice:example.org", "mesh-call");
        let current = co_watch("@alice:example.org", 0);
        meta.merge_co_watch(current.clone());
        let mut tied = co_watch("@bob:example.org", 0);
        tied.started_at = current.started_at;
        assert!(!meta.merge_co_watch(tied));
        assert_eq!(meta.co_watch.as_ref().map(|c| c.started_by.as_str()), Some("@alice:example.org"));
    }

    #[test]
    fn test_adopt_earliest_origin() {
        let mut meta = SessionMetadata::new("@bob:example.org", "mesh-call");
        let earlier = meta.started_at - Duration::seconds(5);
        assert!(meta.adopt_origin("@alice:example.org", earlier, "mesh-call"));
        assert_eq!(meta.started_by, "@alice:example.org");
        assert!(!meta.adopt_origin("@carol:example.org", earlier + Duration::seconds(1), "mesh-call"));
    }
}
