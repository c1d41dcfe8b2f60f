//! Common error types for Maple.

use thiserror::Error;

/// Result type alias using Maple's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Maple operations.
///
/// None of these are fatal to a running session: the session layer logs them
/// and either retries after a delay or carries on.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed signaling or playlist data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Signaling link or HTTP transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Offer/answer or candidate handling rejected by the peer connection
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// A send was attempted while the signaling channel was not open
    #[error("signaling channel is not connected")]
    NotConnected,

    /// The playback surface or its sink refused media
    #[error("playback error: {0}")]
    Playback(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a playback error from any displayable type.
    pub fn playback(msg: impl std::fmt::Display) -> Self {
        Self::Playback(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
