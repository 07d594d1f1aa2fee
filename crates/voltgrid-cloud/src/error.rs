//! Error types for the cloud adapter.

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Classification of a cloud API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    NotFound,
    Auth,
    Quota,
    /// Worth retrying; the adapter retries these internally.
    Transient,
    Fatal,
}

impl std::fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloudErrorKind::NotFound => "not found",
            CloudErrorKind::Auth => "auth",
            CloudErrorKind::Quota => "quota",
            CloudErrorKind::Transient => "transient",
            CloudErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A cloud API failure with its classification.
#[derive(Debug, Clone, Error)]
#[error("cloud error ({kind}): {detail}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub detail: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Auth, detail)
    }

    pub fn quota(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Quota, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Transient, detail)
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Fatal, detail)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CloudErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_detail() {
        let err = CloudError::quota("no RTX 4090 capacity");
        assert_eq!(err.to_string(), "cloud error (quota): no RTX 4090 capacity");
    }

    #[test]
    fn classification_helpers() {
        assert!(CloudError::transient("x").is_transient());
        assert!(!CloudError::fatal("x").is_transient());
        assert!(CloudError::not_found("x").is_not_found());
    }
}
