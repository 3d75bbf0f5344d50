//! Voting errors

use tally_core::{ErrorKind, TallyError, VoteResult};
use thiserror::Error;

/// Result type alias for voting operations
pub type Result<T> = std::result::Result<T, VotingError>;

/// Errors raised by the voting system.
///
/// Failures of a started round carry the failed `VoteResult`
/// (`accepted: false` with the reason in `error_msg`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VotingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Voting session not found: {0}")]
    SessionNotFound(String),

    #[error("Voting session already exists for market data: {0}")]
    Conflict(String),

    #[error("Voting session not active: {0}")]
    SessionNotActive(String),

    #[error("Voting session not complete: {0}")]
    NotComplete(String),

    #[error("Voting timeout for {}", result.market_data_id)]
    Timeout { result: VoteResult },

    #[error("Voting cancelled for {}", result.market_data_id)]
    Cancelled { result: VoteResult },

    #[error("Broadcasting vote request: {reason}")]
    Broadcast { reason: String, result: VoteResult },

    #[error("Voting for data at index {index}: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<VotingError>,
    },
}

impl VotingError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::SessionNotActive(_) | Self::NotComplete(_) => {
                ErrorKind::Conflict
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Broadcast { .. } => ErrorKind::Transport,
            Self::Batch { source, .. } => source.kind(),
        }
    }

    /// The failed round result, for errors raised after a session started
    pub fn result(&self) -> Option<&VoteResult> {
        match self {
            Self::Timeout { result } | Self::Cancelled { result } | Self::Broadcast { result, .. } => {
                Some(result)
            }
            Self::Batch { source, .. } => source.result(),
            _ => None,
        }
    }
}

impl From<TallyError> for VotingError {
    fn from(err: TallyError) -> Self {
        match err {
            TallyError::Validation(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(VotingError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(VotingError::SessionNotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(VotingError::Conflict("x".into()).kind(), ErrorKind::Conflict);

        let timeout = VotingError::Timeout {
            result: VoteResult::failed("x", 0, "voting timeout"),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(timeout.to_string(), "Voting timeout for x");
    }

    #[test]
    fn test_batch_error_delegates() {
        let inner = VotingError::Cancelled {
            result: VoteResult::failed("item-2", 1, "context cancelled"),
        };
        let err = VotingError::Batch {
            index: 2,
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(
            err.result().and_then(|r| r.error_msg.as_deref()),
            Some("context cancelled")
        );
        assert!(err.to_string().starts_with("Voting for data at index 2"));
    }

    #[test]
    fn test_from_core_validation() {
        let err: VotingError = TallyError::Validation("empty symbol".into()).into();
        assert_eq!(err, VotingError::Validation("empty symbol".into()));
        assert!(err.result().is_none());
    }
}
