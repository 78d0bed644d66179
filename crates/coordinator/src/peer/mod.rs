//! Peer connection layer
//!
//! One [`PeerLink`] per remote participant, held in a [`PeerLinkManager`].
//! Initiator election is deterministic: the side whose user id compares
//! lexicographically lower creates the offer, so both sides agree without
//! negotiation.

mod connection;
mod lifecycle;
mod manager;

pub use connection::PeerLink;
pub use lifecycle::{ReconnectPolicy, RestartTracker};
pub use manager::PeerLinkManager;

/// Whether the local participant initiates the connection to `remote_id`.
///
/// Both sides evaluate this with their ids swapped and reach opposite
/// answers, so exactly one side offers.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_election_is_antisymmetric() {
        assert!(is_initiator("@alice:example.org", "@bob:example.org"));
        assert!(!is_initiator("@bob:example.org", "@alice:example.org"));
    }

    #[test]
    fn test_initiator_election_is_byte_order() {
        // Uppercase sorts before lowercase in byte comparison
        assert!(is_initiator("@Zed:example.org", "@amy:example.org"));
    }
}
