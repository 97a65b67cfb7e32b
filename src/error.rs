//! Error types for connection orchestration

use crate::peer::phase::ConnectionPhase;

/// Result type alias using orchestration Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in connection orchestration operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Participant not found in the registry
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Malformed or out-of-order negotiation message
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Transceiver slot order or count violation
    #[error("Transceiver integrity violation: {0}")]
    TransceiverIntegrityError(String),

    /// Automatic reconnection budget exhausted
    #[error("Reconnection attempts exhausted for {participant_id} after {attempts} attempts")]
    RetriesExhausted {
        participant_id: String,
        attempts: u32,
    },

    /// Message arrived in a phase that cannot accept it
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },

    /// Session management error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a transient fault handled by degrade/retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebRtcError(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a negotiation fault (drop the message, no retry)
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Error::NegotiationError(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::SerializationError(_)
                | Error::InvalidData(_)
                | Error::InvalidTransition { .. }
        )
    }

    /// Check if this error is a retry-budget exhaustion
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Error::RetriesExhausted { .. })
    }

    /// Check if this error is a fatal slot-integrity violation
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::TransceiverIntegrityError(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
