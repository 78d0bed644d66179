//! Wire envelopes carried through the shared event log

use crate::channels::ControlMessage;
use crate::participant::Participant;
use crate::session::CoWatchState;
use crate::stage::StageState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signal kinds used during connection negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Broadcast announcement of a new participant
    Join,
    /// Broadcast announcement of departure
    Leave,
    /// SDP offer, targeted
    Offer,
    /// SDP answer, targeted
    Answer,
    /// ICE candidate, targeted
    IceCandidate,
}

/// Negotiation envelope published through the shared event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Session this signal belongs to
    pub session_id: String,

    /// Sender user id
    pub from: String,

    /// Recipient user id; `None` is a broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Signal kind
    pub kind: SignalKind,

    /// Kind-specific payload
    pub payload: serde_json::Value,

    /// Unique id for de-duplication
    pub nonce: String,
}

impl Signal {
    /// Create a broadcast signal
    pub fn broadcast(
        session_id: impl Into<String>,
        from: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            target: None,
            kind,
            payload,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Create a signal addressed to one peer
    pub fn targeted(
        session_id: impl Into<String>,
        from: impl Into<String>,
        target: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            target: Some(target.into()),
            kind,
            payload,
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Whether the local participant should process this signal.
    ///
    /// Self-originated signals and signals addressed to someone else are
    /// dropped by the receiver.
    pub fn is_for(&self, local_id: &str) -> bool {
        if self.from == local_id {
            return false;
        }
        match &self.target {
            Some(target) => target == local_id,
            None => true,
        }
    }
}

/// Payload of a `join` signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// Display name of the joining participant
    pub display_name: String,

    /// Optional avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    /// Role the participant joins with
    pub role: crate::participant::Role,
}

/// Payload of `offer` and `answer` signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    /// Session description
    pub sdp: String,
}

/// Payload of an `ice-candidate` signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// ICE candidate string
    pub candidate: String,

    /// SDP media id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// SDP media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Durable session + stage snapshot (`state` event)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Session this snapshot belongs to
    pub session_id: String,

    /// Sender user id; receivers skip their own snapshots
    pub from: String,

    /// Participant that started the session
    pub started_by: String,

    /// Session start time
    pub started_at: DateTime<Utc>,

    /// Topology identifier
    pub kind: String,

    /// All participants known to the sender
    pub participants: Vec<Participant>,

    /// Co-watch descriptor, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co_watch: Option<CoWatchState>,

    /// Sender's derived stage state
    pub stage: StageState,
}

/// Registry snapshot (`participants` event)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsSnapshot {
    /// Session this snapshot belongs to
    pub session_id: String,

    /// Sender user id; receivers skip their own snapshots
    pub from: String,

    /// All participants known to the sender
    pub participants: Vec<Participant>,

    /// When the snapshot was taken
    pub updated_at: DateTime<Utc>,
}

/// Event published through the shared room event log, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// Session + stage snapshot
    State(StateSnapshot),

    /// Registry snapshot
    Participants(ParticipantsSnapshot),

    /// Connection negotiation
    Signal(Signal),

    /// Mirror of a data-channel control message
    Control {
        /// Session this event belongs to
        session_id: String,
        /// Sender user id
        from: String,
        /// The mirrored control message
        message: ControlMessage,
    },
}

impl RoomEvent {
    /// Session id this event is scoped to
    pub fn session_id(&self) -> &str {
        match self {
            RoomEvent::State(s) => &s.session_id,
            RoomEvent::Participants(p) => &p.session_id,
            RoomEvent::Signal(s) => &s.session_id,
            RoomEvent::Control { session_id, .. } => session_id,
        }
    }

    /// Convert to JSON for transports that carry strings
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize room event: {}", e))
        })
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to deserialize room event: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::Role;

    #[test]
    fn test_signal_filtering() {
        let broadcast = Signal::broadcast("s1", "@alice:example.org", SignalKind::Join, serde_json::json!({}));
        assert!(!broadcast.is_for("@alice:example.org"));
        assert!(broadcast.is_for("@bob:example.org"));

        let targeted = Signal::targeted(
            "s1",
            "@alice:example.org",
            "@bob:example.org",
            SignalKind::Offer,
            serde_json::json!({"sdp": "v=0"}),
        );
        assert!(targeted.is_for("@bob:example.org"));
        assert!(!targeted.is_for("@carol:example.org"));
        assert!(!targeted.is_for("@alice:example.org"));
    }

    #[test]
    fn test_signal_kind_wire_names() {
        let json = serde_json::to_value(SignalKind::IceCandidate).unwrap();
        assert_eq!(json, "ice-candidate");
        let json = serde_json::to_value(SignalKind::Join).unwrap();
        assert_eq!(json, "join");
    }

    #[test]
    fn test_room_event_roundtrip() {
        let event = RoomEvent::Signal(Signal::targeted(
            "s1",
            "@alice:example.org",
            "@bob:example.org",
            SignalKind::Answer,
            serde_json::to_value(SdpPayload { sdp: "v=0\r\n".to_string() }).unwrap(),
        ));
        let json = event.to_json().unwrap();
        let parsed = RoomEvent::from_json(&json).unwrap();
        assert_eq!(event, parsed);
        assert_eq!(parsed.session_id(), "s1");
    }

    #[test]
    fn test_join_payload_roundtrip() {
        let payload = JoinPayload {
            display_name: "Bob".to_string(),
            avatar_url: None,
            role: Role::Listener,
        };
        let value = serde_json::to_value(&payload).unwrap();
        let parsed: JoinPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload, parsed);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let json = r#"{"type":"telemetry","session_id":"s1"}"#;
        assert!(RoomEvent::from_json(json).is_err());
    }
}
