//! Request shapes accepted by the dispatcher's batch surface.

use std::fmt;
use std::path::PathBuf;

use riptide_common::{FileFlags, IoResult, OpId};

use crate::buffer::IoBuf;
use crate::handle::HandleRef;
use crate::op::OpRef;

/// A request naming a filesystem path (open, create, remove).
#[derive(Debug)]
pub struct PathRequest {
    /// Operation that must complete before this one starts.
    pub precondition: Option<OpRef>,
    /// The path to operate on.
    pub path: PathBuf,
    /// The flags for this operation, before force/mask application.
    pub flags: FileFlags,
}

impl PathRequest {
    /// Creates a request with no precondition.
    pub fn new(path: impl Into<PathBuf>, flags: FileFlags) -> Self {
        Self {
            precondition: None,
            path: path.into(),
            flags,
        }
    }

    /// Creates a request ordered after `precondition`.
    pub fn after(precondition: &OpRef, path: impl Into<PathBuf>, flags: FileFlags) -> Self {
        Self {
            precondition: Some(precondition.clone()),
            path: path.into(),
            flags,
        }
    }
}

/// A positional scatter/gather I/O request.
///
/// The precondition supplies the handle to read from or write to and is
/// therefore mandatory.
#[derive(Debug)]
pub struct DataRequest {
    /// The handle-producing operation this I/O depends on.
    pub precondition: OpRef,
    /// Absolute byte offset of the transfer.
    pub offset: u64,
    /// Buffer segments, transferred in order.
    pub buffers: Vec<IoBuf>,
}

impl DataRequest {
    /// Creates an I/O request against the handle produced by
    /// `precondition`.
    pub fn new(precondition: &OpRef, offset: u64, buffers: Vec<IoBuf>) -> Self {
        Self {
            precondition: precondition.clone(),
            offset,
            buffers,
        }
    }
}

/// A caller-supplied completion callback.
pub type CompletionFn =
    Box<dyn FnOnce(OpId, Option<HandleRef>) -> IoResult<HandleRef> + Send + 'static>;

/// A request to run a caller-supplied callback as an operation.
pub struct CompletionRequest {
    /// Operation that must complete before the callback runs.
    pub precondition: Option<OpRef>,
    /// Whether the operation stays pending after the callback returns,
    /// to be finalised later through [`Dispatcher::complete`].
    ///
    /// [`Dispatcher::complete`]: crate::Dispatcher::complete
    pub deferred: bool,
    pub(crate) callback: CompletionFn,
}

impl CompletionRequest {
    /// Creates a completion whose returned handle finalises the operation
    /// as soon as the callback returns.
    pub fn new<F>(precondition: Option<OpRef>, callback: F) -> Self
    where
        F: FnOnce(OpId, Option<HandleRef>) -> IoResult<HandleRef> + Send + 'static,
    {
        Self {
            precondition,
            deferred: false,
            callback: Box::new(callback),
        }
    }

    /// Creates a deferred completion.
    ///
    /// The callback's returned handle is ignored; the caller signals the
    /// outcome later through [`Dispatcher::complete`]. An error returned
    /// by the callback still finalises the operation immediately.
    ///
    /// [`Dispatcher::complete`]: crate::Dispatcher::complete
    pub fn deferred<F>(precondition: Option<OpRef>, callback: F) -> Self
    where
        F: FnOnce(OpId, Option<HandleRef>) -> IoResult<HandleRef> + Send + 'static,
    {
        Self {
            precondition,
            deferred: true,
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("precondition", &self.precondition)
            .field("deferred", &self.deferred)
            .finish()
    }
}
