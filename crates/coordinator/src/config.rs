//! Configuration types for the call coordinator

use crate::peer::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum participants in the mesh, local included (default: 12)
    pub max_participants: u32,

    /// Debounce window for high-frequency state re-publication in
    /// milliseconds (default: 350)
    pub sync_debounce_ms: u64,

    /// Topology identifier written into the session metadata
    pub session_kind: String,

    /// ICE restart policy for failed peer connections
    pub reconnect: ReconnectPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_participants: 12,
            sync_debounce_ms: 350,
            session_kind: "mesh-call".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if:
    /// - no STUN server is configured
    /// - `max_participants` is outside 2-16 (a mesh needs at least two
    ///   members and degrades past sixteen)
    /// - `sync_debounce_ms` exceeds 5000
    pub fn validate(&self) -> crate::Result<()> {
        if self.stun_servers.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "at least one STUN server is required".to_string(),
            ));
        }

        if self.max_participants < 2 || self.max_participants > 16 {
            return Err(crate::Error::InvalidConfig(format!(
                "max_participants must be in range 2-16, got {}",
                self.max_participants
            )));
        }

        if self.sync_debounce_ms > 5000 {
            return Err(crate::Error::InvalidConfig(format!(
                "sync_debounce_ms must be at most 5000, got {}",
                self.sync_debounce_ms
            )));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(crate::Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }
}
