use thiserror::Error;

/// Top-level error type for the braid-core library.
#[derive(Debug, Error)]
pub enum BraidError {
    /// Referenced entity is missing or soft-deleted.
    #[error("not found: {0}")]
    NotFound(String),

    /// The acting user may not perform this operation on this entity.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed input or an illegal state transition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Duplicate key or an attempt to re-transition a terminal entity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An upstream node or processor failed.
    #[error("dependency failure: {0}")]
    DependencyFailure(String),

    /// Transient I/O fault (store disconnect, agent timeout). Retryable.
    #[error("transient io error: {0}")]
    TransientIo(String),

    /// Invariant violation inside the engine. Never retried.
    #[error("internal error: {0}")]
    FatalInternal(String),

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BraidError {
    /// Whether a retry with backoff is worth attempting.
    ///
    /// Only transient I/O faults qualify; everything else either cannot
    /// succeed on retry or must be surfaced to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Io(_))
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, BraidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BraidError::Validation("task already completed".into());
        assert_eq!(err.to_string(), "validation error: task already completed");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: BraidError = io_err.into();
        assert!(matches!(err, BraidError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(BraidError::TransientIo("agent timeout".into()).is_retryable());
        assert!(!BraidError::NotFound("task".into()).is_retryable());
        assert!(!BraidError::Conflict("duplicate subdivision".into()).is_retryable());
        assert!(!BraidError::FatalInternal("completed node without output".into()).is_retryable());
    }
}
