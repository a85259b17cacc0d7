//! Error types for the Riptide engine.
//!
//! Operation futures are shared between every consumer that awaits the same
//! operation, so `IoError` must be `Clone`; OS error sources are therefore
//! stored behind `Arc`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type for engine operations.
pub type IoResult<T> = Result<T, IoError>;

/// Errors that can surface from a submitted operation.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// OS-level I/O error, with the offending path attached when known.
    #[error("I/O error{}: {source}", fmt_path(.path))]
    Os {
        /// The underlying OS error.
        source: Arc<io::Error>,
        /// The path being operated on, when known.
        path: Option<PathBuf>,
    },

    /// Path not found.
    #[error("path not found: {path}")]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Permission denied.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// The inaccessible path.
        path: PathBuf,
    },

    /// Path already exists.
    #[error("path already exists: {path}")]
    AlreadyExists {
        /// The conflicting path.
        path: PathBuf,
    },

    /// A path exists but is not a directory.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// An operation was attempted on a handle whose native resource has
    /// already been released.
    #[error("handle closed: {path}")]
    HandleClosed {
        /// The path of the closed handle.
        path: PathBuf,
    },

    /// The OS transferred fewer bytes than requested.
    #[error("short {operation}: expected {expected} bytes, got {actual}")]
    ShortIo {
        /// "read" or "write".
        operation: &'static str,
        /// Bytes requested.
        expected: usize,
        /// Bytes transferred.
        actual: usize,
    },

    /// A user completion callback failed.
    #[error("user completion failed: {message}")]
    Task {
        /// Captured description of the failure.
        message: String,
    },

    /// A built-in operation ran without the handle its precondition was
    /// supposed to produce (the precondition failed).
    #[error("{operation} requires a handle from its precondition")]
    MissingInput {
        /// The operation that needed a handle.
        operation: &'static str,
    },

    /// The dispatcher was dropped before the operation completed.
    #[error("dispatcher shut down before operation completed")]
    Dropped,

    /// `complete` was called with an identifier not present in the
    /// operation table.
    #[error("operation {id} is not in flight")]
    UnknownOp {
        /// The unknown operation identifier.
        id: u64,
    },

    /// `complete` was called for an operation that was not submitted with
    /// deferred completion.
    #[error("operation {id} was not submitted for deferred completion")]
    NotDeferred {
        /// The offending operation identifier.
        id: u64,
    },
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" at {}", p.display()),
        None => String::new(),
    }
}

impl IoError {
    /// Creates a `NotFound` error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(path: impl Into<PathBuf>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Creates a `NotADirectory` error.
    pub fn not_a_directory(path: impl Into<PathBuf>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    /// Creates a `HandleClosed` error.
    pub fn handle_closed(path: impl Into<PathBuf>) -> Self {
        Self::HandleClosed { path: path.into() }
    }

    /// Creates a `ShortIo` error for reads.
    pub fn short_read(expected: usize, actual: usize) -> Self {
        Self::ShortIo {
            operation: "read",
            expected,
            actual,
        }
    }

    /// Creates a `ShortIo` error for writes.
    pub fn short_write(expected: usize, actual: usize) -> Self {
        Self::ShortIo {
            operation: "write",
            expected,
            actual,
        }
    }

    /// Creates a `Task` error from any displayable failure.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    /// Converts from `std::io::Error`, attaching the offending path.
    ///
    /// Well-known error kinds get their dedicated variants so callers can
    /// match on them without digging into OS error codes.
    pub fn from_io_with_path(err: io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Os {
                source: Arc::new(err),
                path: Some(path),
            },
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Os { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Returns true if this is an "already exists" error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
            || matches!(
                self,
                Self::Os { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
            )
    }

    /// Returns true if this is a permission error.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
            || matches!(
                self,
                Self::Os { source, .. } if source.kind() == io::ErrorKind::PermissionDenied
            )
    }
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self::Os {
            source: Arc::new(err),
            path: None,
        }
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Os { source, .. } => {
                io::Error::new(source.kind(), source.to_string())
            }
            IoError::NotFound { path } => io::Error::new(
                io::ErrorKind::NotFound,
                format!("not found: {}", path.display()),
            ),
            IoError::PermissionDenied { path } => io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            ),
            IoError::AlreadyExists { path } => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("already exists: {}", path.display()),
            ),
            other => io::Error::other(other.to_string()),
        }
    }
}
