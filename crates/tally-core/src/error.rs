//! Error types for Tally core operations

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// Error categories shared by every crate in the workspace.
///
/// Each crate keeps its own error enum; `kind()` on those enums maps them
/// onto this taxonomy so callers can branch on the category alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed vote, item or configuration
    Validation,
    /// Unknown session, peer or record
    NotFound,
    /// Duplicate active session
    Conflict,
    /// Connection limit reached
    Capacity,
    /// Deadline elapsed
    Timeout,
    /// Caller cancelled the operation
    Cancelled,
    /// Dial, publish or channel failure in the networking layer
    Transport,
    /// Anything else
    Internal,
}

/// Errors that can occur in core operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TallyError {
    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Capacity exhausted
    #[error("Capacity reached: {current}/{max}")]
    Capacity { current: usize, max: usize },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> u32 {
        match self.kind() {
            ErrorKind::Validation => 1001,
            ErrorKind::NotFound => 1002,
            ErrorKind::Conflict => 1003,
            ErrorKind::Capacity => 1004,
            ErrorKind::Timeout => 1005,
            ErrorKind::Cancelled => 1006,
            ErrorKind::Transport => 1007,
            ErrorKind::Internal => 9999,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TallyError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TallyError::Capacity { current: 50, max: 50 }.kind(),
            ErrorKind::Capacity
        );
        assert_eq!(TallyError::Storage("io".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TallyError::NotFound("x".into()).code(), 1002);
        assert_eq!(TallyError::Internal("x".into()).code(), 9999);
    }

    #[test]
    fn test_error_display() {
        let err = TallyError::Capacity { current: 3, max: 3 };
        assert_eq!(err.to_string(), "Capacity reached: 3/3");
    }
}
