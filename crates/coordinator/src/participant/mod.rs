//! Participant identity and the local registry
//!
//! The registry is the authoritative local map of participant identity to
//! role/media/connection attributes. Everything rendered or negotiated reads
//! from it; mutation is by targeted key update only, never by replacing the
//! whole map with a remote copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role of a participant within the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Session host (fixed, never demoted by remote data)
    Host,
    /// Moderator (fixed, never demoted by remote data)
    Moderator,
    /// Speaker with presentation rights
    Presenter,
    /// Regular speaker
    Participant,
    /// Audience member
    Listener,
    /// Listener waiting in the hand-raise queue
    RequestingSpeak,
}

impl Role {
    /// Whether this role is currently permitted to send audio/video
    pub fn is_speaking(&self) -> bool {
        matches!(
            self,
            Role::Host | Role::Moderator | Role::Presenter | Role::Participant
        )
    }

    /// Host and moderator are fixed points of the stage state machine
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Host | Role::Moderator)
    }
}

/// Health of the peer connection backing a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    /// No connection attempted yet
    New,
    /// Negotiation in progress
    Connecting,
    /// Connection established
    Connected,
    /// Transient loss of connectivity
    Disconnected,
    /// Connection failed (ICE restart pending)
    Failed,
    /// Connection closed
    Closed,
}

/// A remote media track observed on a participant's peer connection
///
/// Purely local bookkeeping; tracks are learned from the transport, not
/// from snapshots, so each client sees only what actually arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier as announced by the sender
    pub track_id: String,
    /// Media stream the track belongs to
    pub stream_id: String,
    /// Track kind ("audio" or "video")
    pub kind: String,
}

/// A single call participant as seen by the local client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable user identifier, comparable across clients
    pub user_id: String,

    /// Display name
    pub display_name: String,

    /// Optional avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    /// Current role
    pub role: Role,

    /// Microphone muted
    #[serde(default)]
    pub is_muted: bool,

    /// Camera muted
    #[serde(default)]
    pub is_video_muted: bool,

    /// Screen-share active
    #[serde(default)]
    pub is_screensharing: bool,

    /// Co-watch active
    #[serde(default)]
    pub is_co_watching: bool,

    /// Connection health as observed locally
    pub connection: ConnectionHealth,

    /// Set iff role is `RequestingSpeak`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand_raised_at: Option<DateTime<Utc>>,

    /// Last observed activity
    pub last_active: DateTime<Utc>,

    /// Remote tracks received from this participant, local observation only
    #[serde(skip)]
    pub tracks: Vec<RemoteTrack>,

    /// Whether this entry is the local client (never serialized as local
    /// on the wire; each receiver decides for itself)
    #[serde(skip)]
    pub is_local: bool,
}

impl Participant {
    /// Create a participant with default media flags
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role,
            is_muted: false,
            is_video_muted: false,
            is_screensharing: false,
            is_co_watching: false,
            connection: ConnectionHealth::New,
            hand_raised_at: None,
            last_active: Utc::now(),
            tracks: Vec::new(),
            is_local: false,
        }
    }
}

/// The authoritative local participant map
///
/// Keyed by user id. The local participant is inserted at construction and
/// is never overwritten by remote snapshots; the local client is
/// authoritative for its own entry.
#[derive(Debug)]
pub struct ParticipantRegistry {
    entries: BTreeMap<String, Participant>,
    local_id: String,
}

impl ParticipantRegistry {
    /// Create a registry seeded with the local participant
    pub fn new(mut local: Participant) -> Self {
        local.is_local = true;
        local.connection = ConnectionHealth::Connected;
        let local_id = local.user_id.clone();
        let mut entries = BTreeMap::new();
        entries.insert(local_id.clone(), local);
        Self { entries, local_id }
    }

    /// User id of the local participant
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The local participant entry
    pub fn local(&self) -> &Participant {
        // The constructor guarantees the entry exists and remove() refuses
        // to drop it.
        self.entries
            .get(&self.local_id)
            .expect("local participant always present")
    }

    /// Number of participants, local included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether only the local participant remains
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Whether a participant exists
    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Look up a participant
    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.entries.get(user_id)
    }

    /// Targeted mutation of a single entry. Returns false if absent.
    pub fn update<F>(&mut self, user_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        match self.entries.get_mut(user_id) {
            Some(p) => {
                f(p);
                p.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Insert or update a remote participant from a `join` announcement.
    ///
    /// An existing entry keeps its role and hand-raise state (a re-join
    /// after reconnect must not reset a queued hand); metadata is refreshed.
    /// The local entry is never touched.
    pub fn upsert_remote(&mut self, incoming: Participant) {
        if incoming.user_id == self.local_id {
            return;
        }
        match self.entries.get_mut(&incoming.user_id) {
            Some(existing) => {
                existing.display_name = incoming.display_name;
                existing.avatar_url = incoming.avatar_url;
                existing.last_active = Utc::now();
            }
            None => {
                let mut p = incoming;
                p.is_local = false;
                p.last_active = Utc::now();
                self.entries.insert(p.user_id.clone(), p);
            }
        }
    }

    /// Reconcile a remote registry snapshot.
    ///
    /// Upsert-only and defensive: the local entry is skipped, and a
    /// host/moderator role already held locally is never overwritten by
    /// remote data. Snapshots never delete; only `leave` removes.
    pub fn apply_snapshot(&mut self, participants: Vec<Participant>) {
        for incoming in participants {
            if incoming.user_id == self.local_id {
                continue;
            }
            match self.entries.get_mut(&incoming.user_id) {
                Some(existing) => {
                    let keep_role = existing.role.is_privileged();
                    existing.display_name = incoming.display_name;
                    existing.avatar_url = incoming.avatar_url;
                    existing.is_muted = incoming.is_muted;
                    existing.is_video_muted = incoming.is_video_muted;
                    existing.is_screensharing = incoming.is_screensharing;
                    existing.is_co_watching = incoming.is_co_watching;
                    existing.last_active = Utc::now();
                    if !keep_role {
                        existing.role = incoming.role;
                        existing.hand_raised_at = if incoming.role == Role::RequestingSpeak {
                            incoming.hand_raised_at.or(Some(Utc::now()))
                        } else {
                            None
                        };
                    }
                }
                None => {
                    let mut p = incoming;
                    p.is_local = false;
                    p.connection = ConnectionHealth::New;
                    if p.role == Role::RequestingSpeak && p.hand_raised_at.is_none() {
                        p.hand_raised_at = Some(Utc::now());
                    } else if p.role != Role::RequestingSpeak {
                        p.hand_raised_at = None;
                    }
                    self.entries.insert(p.user_id.clone(), p);
                }
            }
        }
    }

    /// Record a remote track for a participant.
    ///
    /// Media arriving is the strongest liveness signal there is, so the
    /// entry is marked connected. Returns false if the participant is
    /// unknown or the track was already recorded.
    pub fn record_track(&mut self, user_id: &str, track: RemoteTrack) -> bool {
        match self.entries.get_mut(user_id) {
            Some(p) => {
                if p.tracks.iter().any(|t| t.track_id == track.track_id) {
                    return false;
                }
                p.tracks.push(track);
                p.connection = ConnectionHealth::Connected;
                p.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Drop every recorded track for a participant, returning how many were
    /// cleared. Called when the backing connection goes away.
    pub fn clear_tracks(&mut self, user_id: &str) -> usize {
        match self.entries.get_mut(user_id) {
            Some(p) => {
                let cleared = p.tracks.len();
                p.tracks.clear();
                cleared
            }
            None => 0,
        }
    }

    /// Remove a participant. The local entry cannot be removed.
    pub fn remove(&mut self, user_id: &str) -> Option<Participant> {
        if user_id == self.local_id {
            return None;
        }
        self.entries.remove(user_id)
    }

    /// Snapshot of all participants, ordered by user id
    pub fn participants(&self) -> Vec<Participant> {
        self.entries.values().cloned().collect()
    }

    /// Iterate over all participants
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ParticipantRegistry {
        ParticipantRegistry::new(Participant::new("@alice:example.org", "Alice", Role::Host))
    }

    #[test]
    fn test_local_seeded() {
        let reg = registry();
        assert_eq!(reg.local_id(), "@alice:example.org");
        assert!(reg.local().is_local);
        assert_eq!(reg.len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_upsert_remote_keeps_existing_role() {
        let mut reg = registry();
        let mut bob = Participant::new("@bob:example.org", "Bob", Role::Listener);
        bob.role = Role::RequestingSpeak;
        bob.hand_raised_at = Some(Utc::now());
        reg.upsert_remote(bob);

        // Re-join with a plain listener role must not reset the queued hand
        reg.upsert_remote(Participant::new("@bob:example.org", "Bobby", Role::Listener));
        let bob = reg.get("@bob:example.org").unwrap();
        assert_eq!(bob.role, Role::RequestingSpeak);
        assert_eq!(bob.display_name, "Bobby");
        assert!(bob.hand_raised_at.is_some());
    }

    #[test]
    fn test_upsert_never_touches_local() {
        let mut reg = registry();
        reg.upsert_remote(Participant::new("@alice:example.org", "Mallory", Role::Listener));
        assert_eq!(reg.local().display_name, "Alice");
        assert_eq!(reg.local().role, Role::Host);
    }

    #[test]
    fn test_snapshot_never_downgrades_privileged() {
        let mut reg = registry();
        let mut carol = Participant::new("@carol:example.org", "Carol", Role::Moderator);
        carol.is_local = false;
        reg.upsert_remote(carol);

        reg.apply_snapshot(vec![Participant::new(
            "@carol:example.org",
            "Carol",
            Role::Listener,
        )]);
        assert_eq!(reg.get("@carol:example.org").unwrap().role, Role::Moderator);
    }

    #[test]
    fn test_snapshot_repairs_hand_raise_stamp() {
        let mut reg = registry();
        let mut dave = Participant::new("@dave:example.org", "Dave", Role::RequestingSpeak);
        dave.hand_raised_at = None; // malformed on the wire
        reg.apply_snapshot(vec![dave]);
        let dave = reg.get("@dave:example.org").unwrap();
        assert!(dave.hand_raised_at.is_some());
    }

    #[test]
    fn test_remove_refuses_local() {
        let mut reg = registry();
        assert!(reg.remove("@alice:example.org").is_none());
        assert_eq!(reg.len(), 1);
    }

    fn audio_track(track_id: &str) -> RemoteTrack {
        RemoteTrack {
            track_id: track_id.to_string(),
            stream_id: "stream-1".to_string(),
            kind: "audio".to_string(),
        }
    }

    #[test]
    fn test_record_track_dedupes_and_marks_connected() {
        let mut reg = registry();
        let mut bob = Participant::new("@bob:example.org", "Bob", Role::Listener);
        bob.connection = ConnectionHealth::Connecting;
        reg.upsert_remote(bob);

        assert!(reg.record_track("@bob:example.org", audio_track("t1")));
        assert!(!reg.record_track("@bob:example.org", audio_track("t1")));
        assert!(!reg.record_track("@ghost:example.org", audio_track("t2")));

        let bob = reg.get("@bob:example.org").unwrap();
        assert_eq!(bob.tracks.len(), 1);
        assert_eq!(bob.connection, ConnectionHealth::Connected);
    }

    #[test]
    fn test_clear_tracks_on_connection_loss() {
        let mut reg = registry();
        reg.upsert_remote(Participant::new("@bob:example.org", "Bob", Role::Listener));
        reg.record_track("@bob:example.org", audio_track("t1"));
        reg.record_track("@bob:example.org", audio_track("t2"));

        assert_eq!(reg.clear_tracks("@bob:example.org"), 2);
        assert!(reg.get("@bob:example.org").unwrap().tracks.is_empty());
        assert_eq!(reg.clear_tracks("@ghost:example.org"), 0);
    }

    #[test]
    fn test_tracks_stay_off_the_wire() {
        let mut bob = Participant::new("@bob:example.org", "Bob", Role::Listener);
        bob.tracks.push(audio_track("t1"));

        let json = serde_json::to_string(&bob).unwrap();
        assert!(!json.contains("t1"));
        let back: Participant = serde_json::from_str(&json).unwrap();
        assert!(back.tracks.is_empty());
    }

    #[test]
    fn test_update_targets_single_key() {
        let mut reg = registry();
        reg.upsert_remote(Participant::new("@bob:example.org", "Bob", Role::Listener));
        assert!(reg.update("@bob:example.org", |p| p.is_muted = true));
        assert!(reg.get("@bob:example.org").unwrap().is_muted);
        assert!(!reg.update("@nobody:example.org", |p| p.is_muted = true));
    }
}
