//! Error types for the store adapter.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the task/worker store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Retried inside the adapter; surfaces only after retry exhaustion.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store rejected credentials: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode store response: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_transient() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Auth("bad key".into()).is_transient());
        assert!(!StoreError::NotFound("w".into()).is_transient());
        assert!(!StoreError::Decode("json".into()).is_transient());
        assert!(!StoreError::Fatal("oops".into()).is_transient());
    }
}
