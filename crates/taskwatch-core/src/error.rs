use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for taskwatch operations
pub type Result<T> = std::result::Result<T, TaskwatchError>;

/// Errors that can occur while scanning and classifying tasks
#[derive(Error, Debug)]
pub enum TaskwatchError {
    /// File vanished before it could be read
    #[error("file not found: {}", path.display())]
    NotFound {
        /// Path that disappeared
        path: PathBuf,
    },

    /// File exists but could not be read
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Path being read
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Insufficient privilege to inspect a process
    #[error("permission denied inspecting {what} of pid {pid}")]
    PermissionDenied {
        /// Process being inspected
        pid: i32,
        /// Which part of the process was being read
        what: &'static str,
    },

    /// Process exited while it was being inspected
    #[error("process {pid} exited during inspection")]
    ProcessGone {
        /// Process that exited
        pid: i32,
    },

    /// Reading the process table failed outright
    #[error("procfs error: {0}")]
    Procfs(String),

    /// HTTP request to the reputation service failed
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Reputation service asked us to slow down
    #[error("throttled by reputation service, retry after {retry_after:?}")]
    Throttled {
        /// Provider-suggested wait
        retry_after: Option<Duration>,
    },

    /// Authentication failed - invalid or missing API key
    #[error("authentication failed: invalid API key")]
    Unauthorized,

    /// Reputation service answered with something we could not parse
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Reputation service returned an unexpected status
    #[error("API error ({code}): {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message from the API
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TaskwatchError {
    /// Classify an I/O failure on `path`.
    ///
    /// A missing file becomes [`TaskwatchError::NotFound`]; anything else
    /// (permissions included) is a [`TaskwatchError::Read`].
    pub fn read(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Read { path, source }
        }
    }

    /// Returns true if the error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Throttled { .. } => true,
            Self::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Returns true if the error is due to authentication
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Returns true if the error means "the thing went away mid-scan"
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ProcessGone { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_maps_missing_file_to_not_found() {
        let err = TaskwatchError::read(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, TaskwatchError::NotFound { .. }));
        assert!(err.is_transient());

        let err = TaskwatchError::read(
            "/root/secret",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, TaskwatchError::Read { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn retryable_classification() {
        assert!(TaskwatchError::Network("reset".into()).is_retryable());
        assert!(TaskwatchError::Throttled { retry_after: None }.is_retryable());
        assert!(TaskwatchError::Api { code: 503, message: String::new() }.is_retryable());
        assert!(!TaskwatchError::Api { code: 400, message: String::new() }.is_retryable());
        assert!(!TaskwatchError::Unauthorized.is_retryable());
        assert!(TaskwatchError::Unauthorized.is_auth_error());
        assert!(!TaskwatchError::MalformedResponse("x".into()).is_retryable());
    }
}
