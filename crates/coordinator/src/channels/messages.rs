//! Control-channel message types
//!
//! Messages exchanged over a peer's direct data channel once a connection
//! exists. The same envelopes are mirrored through the shared event log as
//! `control` events, so consumers must treat both paths as idempotent
//! last-value-wins updates.

use crate::participant::{Participant, Role};
use crate::session::CoWatchState;
use crate::stage::StageState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control message envelope, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Full registry snapshot for low-latency convergence
    ParticipantsSync {
        /// All participants known to the sender
        participants: Vec<Participant>,
        /// When the snapshot was taken
        updated_at: DateTime<Utc>,
    },

    /// A participant started or stopped screen-sharing
    ScreenshareToggle {
        /// Affected participant
        user_id: String,
        /// New screenshare state
        active: bool,
    },

    /// Full derived stage partition
    StageUpdate {
        /// Sender's stage state
        stage: StageState,
    },

    /// A participant was promoted to the stage
    StageInvite {
        /// Promoted participant
        user_id: String,
        /// Speaking role granted
        role: Role,
    },

    /// A hand entered the queue
    HandRaise {
        /// Queued participant
        user_id: String,
        /// Queue position stamp
        raised_at: DateTime<Utc>,
    },

    /// A hand left the queue, or a speaker was demoted
    HandLower {
        /// Affected participant
        user_id: String,
    },

    /// Co-watch started or stopped
    CowatchToggle {
        /// New co-watch descriptor (LWW by `started_at`)
        co_watch: CoWatchState,
    },
}

impl ControlMessage {
    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ParticipantsSync { .. } => "participants-sync",
            ControlMessage::ScreenshareToggle { .. } => "screenshare-toggle",
            ControlMessage::StageUpdate { .. } => "stage-update",
            ControlMessage::StageInvite { .. } => "stage-invite",
            ControlMessage::HandRaise { .. } => "hand-raise",
            ControlMessage::HandLower { .. } => "hand-lower",
            ControlMessage::CowatchToggle { .. } => "cowatch-toggle",
        }
    }

    /// Serialize for transmission over a data channel
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize control message: {}", e))
        })
    }

    /// Deserialize from data channel bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize control message: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags_match_protocol() {
        let msg = ControlMessage::HandRaise {
            user_id: "@bob:example.org".to_string(),
            raised_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "hand-raise");

        let msg = ControlMessage::ParticipantsSync {
            participants: Vec::new(),
            updated_at: Utc::now(),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "participants-sync");

        let msg = ControlMessage::CowatchToggle {
            co_watch: CoWatchState {
                active: true,
                url: Some("https://example.org/v".to_string()),
                started_by: "@alice:example.org".to_string(),
                started_at: Utc::now(),
            },
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "cowatch-toggle");
    }

    #[test]
    fn test_roundtrip() {
        let msg = ControlMessage::StageInvite {
            user_id: "@bob:example.org".to_string(),
            role: Role::Presenter,
        };
        let bytes = msg.to_bytes().unwrap();
        let decoded = ControlMessage::from_bytes(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(ControlMessage::from_bytes(b"not json").is_err());
        assert!(ControlMessage::from_bytes(br#"{"type":"unknown-kind","payload":{}}"#).is_err());
    }

    #[test]
    fn test_kind_names() {
        let msg = ControlMessage::HandLower {
            user_id: "@bob:example.org".to_string(),
        };
        assert_eq!(msg.kind(), "hand-lower");
    }
}
