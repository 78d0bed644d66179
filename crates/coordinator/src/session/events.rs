//! Typed events emitted by a call session

use crate::participant::Participant;
use crate::session::CoWatchState;
use crate::stage::StageState;

/// Notification delivered to session subscribers.
///
/// Events are state snapshots, not deltas: consumers may coalesce or drop
/// them and re-read the session accessors at any time.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The participant registry changed
    ParticipantsChanged(Vec<Participant>),

    /// The derived stage partition changed
    StageChanged(StageState),

    /// A participant started or stopped screen-sharing
    ScreenshareChanged {
        /// Affected participant
        user_id: String,
        /// New screenshare state
        active: bool,
    },

    /// Co-watch state changed
    CoWatchChanged(Option<CoWatchState>),

    /// A non-fatal error occurred
    Error(String),

    /// The session was torn down; no further events follow
    Disposed,
}
