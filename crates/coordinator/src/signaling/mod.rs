//! Signaling transport: wire envelopes and the injected event log

mod envelope;
mod event_log;
mod memory;

pub use envelope::{
    CandidatePayload, JoinPayload, ParticipantsSnapshot, RoomEvent, SdpPayload, Signal,
    SignalKind, StateSnapshot,
};
pub use event_log::{EventLog, EventStream};
pub use memory::InMemoryEventLog;
