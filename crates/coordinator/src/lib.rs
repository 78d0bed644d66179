//! Serverless coordinator for WebRTC mesh group calls
//!
//! Every client runs the same coordinator; there is no call server. Clients
//! discover each other through a shared, ordered room event log (injected as
//! an [`EventLog`] implementation), negotiate full-mesh peer connections
//! with deterministic initiator election, and keep session state converging
//! over two independent paths: durable event-log snapshots and low-latency
//! per-peer data channels.
//!
//! The entry point is [`CallSession`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshcall_coordinator::{
//!     CallSession, CoordinatorConfig, InMemoryEventLog, Role, SessionOptions,
//! };
//!
//! # async fn example() -> meshcall_coordinator::Result<()> {
//! let log = InMemoryEventLog::new();
//! let session = CallSession::create(
//!     log,
//!     SessionOptions {
//!         session_id: "!room:example.org".to_string(),
//!         user_id: "@alice:example.org".to_string(),
//!         display_name: "Alice".to_string(),
//!         avatar_url: None,
//!         role: Role::Host,
//!         config: CoordinatorConfig::default(),
//!     },
//! )
//! .await?;
//!
//! let mut _events = session.subscribe();
//! session.raise_hand().await?;
//! session.leave().await;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod participant;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod stage;
pub mod sync;

pub use channels::{ControlChannel, ControlMessage, CONTROL_CHANNEL_LABEL};
pub use config::{CoordinatorConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use media::LocalMedia;
pub use participant::{ConnectionHealth, Participant, ParticipantRegistry, RemoteTrack, Role};
pub use peer::{is_initiator, PeerLink, PeerLinkManager, ReconnectPolicy, RestartTracker};
pub use session::{
    CallSession, CoWatchState, SessionEvent, SessionMetadata, SessionOptions,
};
pub use signaling::{
    CandidatePayload, EventLog, EventStream, InMemoryEventLog, JoinPayload,
    ParticipantsSnapshot, RoomEvent, SdpPayload, Signal, SignalKind, StateSnapshot,
};
pub use stage::{StageAction, StageState};
pub use sync::{BroadcastStats, SessionSynchronizer};
