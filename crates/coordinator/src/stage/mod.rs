//! Stage and hand-raise state machine
//!
//! The only component allowed to change a participant's role. Participants
//! cycle `Listener -> RequestingSpeak -> {Participant|Presenter} -> Listener`
//! for the session lifetime; host and moderator are fixed points.
//!
//! Every mutation returns a [`StageAction`] telling the caller what to
//! broadcast, and the caller re-derives [`StageState`] afterwards.

use crate::participant::{ParticipantRegistry, Role};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Derived speaker/listener/queue partition of the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    /// Participants permitted to send audio/video, ordered by user id
    pub speakers: Vec<String>,

    /// Audience, ordered by user id
    pub listeners: Vec<String>,

    /// Hand-raise queue, ordered by raise time ascending (ties by user id)
    pub hand_raise_queue: Vec<String>,
}

/// What a stage mutation asks the caller to broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    /// Nothing changed
    None,
    /// A hand entered the queue
    HandRaised {
        /// Queued participant
        user_id: String,
        /// Queue position stamp
        raised_at: DateTime<Utc>,
    },
    /// A hand left the queue (also used for demotion to the audience)
    HandLowered {
        /// Affected participant
        user_id: String,
    },
    /// A participant was promoted to the stage
    Invited {
        /// Promoted participant
        user_id: String,
        /// Speaking role granted
        role: Role,
    },
}

/// Recompute the stage partition from the registry
pub fn derive_stage(registry: &ParticipantRegistry) -> StageState {
    let mut speakers = Vec::new();
    let mut listeners = Vec::new();
    let mut queue: Vec<(DateTime<Utc>, String)> = Vec::new();

    for p in registry.iter() {
        match p.role {
            Role::Listener => listeners.push(p.user_id.clone()),
            Role::RequestingSpeak => {
                // The registry invariant guarantees the stamp; fall back to
                // now so a malformed entry still sorts deterministically.
                let at = p.hand_raised_at.unwrap_or_else(Utc::now);
                queue.push((at, p.user_id.clone()));
            }
            _ => speakers.push(p.user_id.clone()),
        }
    }

    queue.sort();
    StageState {
        speakers,
        listeners,
        hand_raise_queue: queue.into_iter().map(|(_, id)| id).collect(),
    }
}

/// Raise the hand of `user_id` (normally the local participant).
///
/// No-op if the role already grants speaking rights; acts as `lower_hand`
/// if the hand is already raised.
pub fn raise_hand(registry: &mut ParticipantRegistry, user_id: &str) -> StageAction {
    let role = match registry.get(user_id) {
        Some(p) => p.role,
        None => return StageAction::None,
    };

    match role {
        _ if role.is_speaking() => StageAction::None,
        Role::RequestingSpeak => lower_hand(registry, user_id),
        Role::Listener => {
            let raised_at = Utc::now();
            registry.update(user_id, |p| {
                p.role = Role::RequestingSpeak;
                p.hand_raised_at = Some(raised_at);
            });
            debug!(user_id, "hand raised");
            StageAction::HandRaised {
                user_id: user_id.to_string(),
                raised_at,
            }
        }
        _ => StageAction::None,
    }
}

/// Lower the hand of `user_id`, or demote a queued participant back to the
/// audience. Idempotent; host/moderator are immune.
pub fn lower_hand(registry: &mut ParticipantRegistry, user_id: &str) -> StageAction {
    let role = match registry.get(user_id) {
        Some(p) => p.role,
        None => return StageAction::None,
    };

    match role {
        Role::RequestingSpeak => {
            registry.update(user_id, |p| {
                p.role = Role::Listener;
                p.hand_raised_at = None;
            });
            debug!(user_id, "hand lowered");
            StageAction::HandLowered {
                user_id: user_id.to_string(),
            }
        }
        // Already a listener: clear a stray stamp, nothing to broadcast
        Role::Listener => {
            registry.update(user_id, |p| p.hand_raised_at = None);
            StageAction::None
        }
        _ => StageAction::None,
    }
}

/// Promote a listener or queued participant to a speaking role.
///
/// Host/moderator targets are left untouched. Non-speaking roles passed as
/// `role` are coerced to `Participant`.
pub fn bring_to_stage(
    registry: &mut ParticipantRegistry,
    user_id: &str,
    role: Role,
) -> StageAction {
    let current = match registry.get(user_id) {
        Some(p) => p.role,
        None => return StageAction::None,
    };

    if current.is_privileged() {
        return StageAction::None;
    }

    let granted = match role {
        Role::Presenter => Role::Presenter,
        _ => Role::Participant,
    };

    registry.update(user_id, |p| {
        p.role = granted;
        p.hand_raised_at = None;
    });
    debug!(user_id, role = ?granted, "brought to stage");
    StageAction::Invited {
        user_id: user_id.to_string(),
        role: granted,
    }
}

/// Demote a non-privileged speaker to the audience.
///
/// Broadcast as `hand-lower` on the wire (the demotion reuses the same
/// message).
pub fn send_to_audience(registry: &mut ParticipantRegistry, user_id: &str) -> StageAction {
    let current = match registry.get(user_id) {
        Some(p) => p.role,
        None => return StageAction::None,
    };

    if current.is_privileged() {
        return StageAction::None;
    }

    if current == Role::Listener && registry.get(user_id).and_then(|p| p.hand_raised_at).is_none()
    {
        return StageAction::None;
    }

    registry.update(user_id, |p| {
        p.role = Role::Listener;
        p.hand_raised_at = None;
    });
    debug!(user_id, "sent to audience");
    StageAction::HandLowered {
        user_id: user_id.to_string(),
    }
}

/// Apply a remote `hand-raise` message
pub fn apply_hand_raise(
    registry: &mut ParticipantRegistry,
    user_id: &str,
    raised_at: DateTime<Utc>,
) {
    registry.update(user_id, |p| {
        if !p.role.is_privileged() && !p.role.is_speaking() {
            p.role = Role::RequestingSpeak;
            p.hand_raised_at = Some(raised_at);
        }
    });
}

/// Apply a remote `hand-lower` message (also the demotion signal)
pub fn apply_hand_lower(registry: &mut ParticipantRegistry, user_id: &str) {
    registry.update(user_id, |p| {
        if !p.role.is_privileged() {
            p.role = Role::Listener;
            p.hand_raised_at = None;
        }
    });
}

/// Apply a remote `stage-invite` message
pub fn apply_invite(registry: &mut ParticipantRegistry, user_id: &str, role: Role) {
    let granted = match role {
        Role::Presenter => Role::Presenter,
        _ => Role::Participant,
    };
    registry.update(user_id, |p| {
        if !p.role.is_privileged() {
            p.role = granted;
            p.hand_raised_at = None;
        }
    });
}

/// Defensive reconciliation of an externally published stage state.
///
/// Incoming lists set roles, but host/moderator roles already held locally
/// are never overwritten. Queue order is preserved by spacing synthetic
/// stamps for entries that lack one.
pub fn apply_remote_stage(registry: &mut ParticipantRegistry, stage: &StageState) {
    for id in &stage.speakers {
        registry.update(id, |p| {
            if !p.role.is_privileged() && !p.role.is_speaking() {
                p.role = Role::Participant;
                p.hand_raised_at = None;
            }
        });
    }

    for id in &stage.listeners {
        registry.update(id, |p| {
            if !p.role.is_privileged() {
                p.role = Role::Listener;
                p.hand_raised_at = None;
            }
        });
    }

    let base = Utc::now();
    for (i, id) in stage.hand_raise_queue.iter().enumerate() {
        registry.update(id, |p| {
            if !p.role.is_privileged() && !p.role.is_speaking() {
                p.role = Role::RequestingSpeak;
                if p.hand_raised_at.is_none() {
                    p.hand_raised_at = Some(base + Duration::milliseconds(i as i64));
                }
            }
        });
    }
}
