//! Error types for the panel-to-storage pipeline.
//!
//! Every failure the pipeline can surface maps onto exactly one
//! [`UplinkError`] variant so callers can decide on messaging and exit
//! status without string matching.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a storage network backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum UplinkError {
    /// Credentials rejected by the panel account API.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection refused, DNS failure, request timeout, server-side 5xx.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or oversized panel response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed serialized scope or API key.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Timed out after {}s waiting for the backup to complete", .0.as_secs())]
    TimedOut(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UplinkError {
    /// Short stable name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UplinkError::Auth(_) => "auth",
            UplinkError::Transport(_) => "transport",
            UplinkError::Protocol(_) => "protocol",
            UplinkError::Format(_) => "format",
            UplinkError::Validation(_) => "validation",
            UplinkError::Storage(_) => "storage",
            UplinkError::TimedOut(_) => "timed_out",
            UplinkError::Cancelled => "cancelled",
            UplinkError::Config(_) => "config",
            UplinkError::Io(_) => "io",
        }
    }

    /// Only network-level failures may be retried, and only by the poller.
    pub fn is_transient(&self) -> bool {
        matches!(self, UplinkError::Transport(_))
    }
}

impl From<reqwest::Error> for UplinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UplinkError::Protocol(err.to_string())
        } else {
            UplinkError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, UplinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(UplinkError::Transport("connection refused".into()).is_transient());
        assert!(!UplinkError::Auth("401".into()).is_transient());
        assert!(!UplinkError::Protocol("bad json".into()).is_transient());
        assert!(!UplinkError::TimedOut(Duration::from_secs(5)).is_transient());
        assert!(!UplinkError::Storage(StorageError::Upload("x".into())).is_transient());
    }

    #[test]
    fn test_storage_error_keeps_its_kind() {
        let err: UplinkError = StorageError::BucketNotFound("backups".into()).into();
        assert_eq!(err.kind(), "storage");
        assert!(matches!(
            err,
            UplinkError::Storage(StorageError::BucketNotFound(ref name)) if name == "backups"
        ));
    }

    #[test]
    fn test_timed_out_message() {
        let err = UplinkError::TimedOut(Duration::from_secs(90));
        assert_eq!(
            err.to_string(),
            "Timed out after 90s waiting for the backup to complete"
        );
        assert_eq!(err.kind(), "timed_out");
    }
}
