//! Networking errors

use tally_core::{ErrorKind, PeerId};
use thiserror::Error;

/// Result type alias for networking operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors raised by the networking layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Connection limit reached: {current}/{max}")]
    Capacity { current: usize, max: usize },

    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("Dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    #[error("Dial to {0} timed out")]
    DialTimeout(PeerId),

    #[error("Closing connection to {peer} failed: {reason}")]
    CloseFailed { peer: PeerId, reason: String },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Swarm not initialized")]
    NotInitialized,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl NetworkError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::NotConnected(_) => ErrorKind::NotFound,
            Self::DialTimeout(_) => ErrorKind::Timeout,
            Self::AlreadyRunning => ErrorKind::Conflict,
            Self::InvalidAddress(_) | Self::Config(_) | Self::Codec(_) => ErrorKind::Validation,
            Self::NotInitialized => ErrorKind::Internal,
            Self::DialFailed { .. }
            | Self::CloseFailed { .. }
            | Self::Channel(_)
            | Self::Publish(_)
            | Self::Subscribe(_)
            | Self::Dht(_) => ErrorKind::Transport,
        }
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            NetworkError::Capacity { current: 5, max: 5 }.kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            NetworkError::NotConnected(PeerId::new("p")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            NetworkError::DialTimeout(PeerId::new("p")).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            NetworkError::Publish("InsufficientPeers".into()).kind(),
            ErrorKind::Transport
        );
    }
}
