//! Error types for the call coordinator

/// Result type alias using the coordinator Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in call-coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Event-log publication or subscription error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Participant not found in the registry
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Peer link not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Control channel error
    #[error("Control channel error: {0}")]
    ControlChannelError(String),

    /// Local media acquisition or track error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Session already disposed
    #[error("Session disposed")]
    Disposed,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::ControlChannelError(_)
        )
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
        )
    }

    /// Check if this error is fatal to session creation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::MediaError(_) | Error::Disposed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("bad debounce".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad debounce");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("log write".to_string()).is_retryable());
        assert!(!Error::MediaError("no device".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::PeerNotFound("@bob:example.org".to_string()).is_peer_error());
        assert!(Error::SdpError("parse".to_string()).is_peer_error());
        assert!(!Error::InvalidConfig("x".to_string()).is_peer_error());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::MediaError("capture failed".to_string()).is_fatal());
        assert!(!Error::SignalingError("transient".to_string()).is_fatal());
    }
}
