// Centralized error handling for the sync engine
// Every variant carries enough context (path, operation) to be logged on its own

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sync operations.
///
/// Per-path failures (`Io`, `PermissionDenied`, `Conflict`, `ShortCopy`,
/// `PermissionPropagation`) are recoverable and get reported through the
/// run log. Configuration failures are fatal and abort the run before
/// traversal begins, see [`SyncError::is_fatal`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// File system errors with context
    #[error("I/O error while {operation} '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied while {operation} '{}'", path.display())]
    PermissionDenied { path: PathBuf, operation: String },

    /// Filter errors
    #[error("The filter regexp '{pattern}' is not valid: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("The filter file '{}' does not exist", path.display())]
    FilterFileNotFound { path: PathBuf },

    /// Source or destination root is unusable
    #[error("{role} '{}' {reason}", path.display())]
    InvalidRoot {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Destination exists in a shape the run is not allowed to replace
    #[error("Cannot sync '{path}': {reason}")]
    Conflict { path: String, reason: String },

    #[error("Failed to copy '{path}': wrote {written} of {expected} bytes")]
    ShortCopy {
        path: String,
        written: u64,
        expected: u64,
    },

    #[error("Failed to change permissions on '{path}'")]
    PermissionPropagation { path: String },

    /// Raised by the container codec when the bytes are plain content
    #[error("'{}' is not a sqsync container", path.display())]
    NotAContainer { path: PathBuf },
}

impl SyncError {
    /// Create an Io error with context, mapping permission failures to their own variant.
    pub fn from_io_error(err: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => SyncError::PermissionDenied {
                path,
                operation: operation.to_string(),
            },
            _ => SyncError::Io {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }

    /// Whether this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidPattern { .. }
                | SyncError::FilterFileNotFound { .. }
                | SyncError::InvalidRoot { .. }
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
