//! Operation kind tags.

use std::fmt;

/// The closed set of operation kinds a dispatcher can execute.
///
/// The kind is set when an operation is submitted and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Placeholder for operations of unknown provenance.
    Unknown,
    /// A caller-supplied completion callback.
    UserCompletion,
    /// Directory creation (and optional open).
    DirCreate,
    /// Directory removal.
    DirRemove,
    /// File open/create.
    FileOpen,
    /// File removal.
    FileRemove,
    /// Flush a handle's written data to storage.
    Sync,
    /// Release a handle's native resource.
    Close,
    /// Positional scatter read.
    Read,
    /// Positional gather write.
    Write,
}

impl OpKind {
    /// Returns a short static name for diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::UserCompletion => "completion",
            Self::DirCreate => "dir",
            Self::DirRemove => "rmdir",
            Self::FileOpen => "file",
            Self::FileRemove => "rmfile",
            Self::Sync => "sync",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Returns true if completion of this kind may be signalled out of
    /// band rather than by the worker task's return value.
    pub const fn may_defer(self) -> bool {
        matches!(self, Self::UserCompletion | Self::Read | Self::Write)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
