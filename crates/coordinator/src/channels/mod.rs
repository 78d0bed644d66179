//! Per-peer control channel and its message types

mod control;
mod messages;

pub use control::{ControlChannel, CONTROL_CHANNEL_LABEL};
pub use messages::ControlMessage;
