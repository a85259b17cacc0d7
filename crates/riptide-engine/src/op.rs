//! The operation table and operation descriptors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use riptide_common::{
    IoError, IoResult, OpId, OpKind, NO_PRECONDITION, OP_TABLE_INITIAL_CAPACITY,
};

use crate::dispatch::Dispatcher;
use crate::handle::HandleRef;

/// A task bound to its operation, waiting for its precondition's handle.
pub(crate) type BoundTask = Box<dyn FnOnce(Option<HandleRef>) + Send + 'static>;

/// The shareable future yielding an operation's outcome.
pub(crate) type OpFuture = Shared<BoxFuture<'static, IoResult<HandleRef>>>;

/// Creates the single-fulfilment promise/future pair for one operation.
///
/// The sender side lives in the operation record and is consumed exactly
/// once by the completion path; a dropped sender (dispatcher torn down
/// mid-flight) surfaces as [`IoError::Dropped`].
pub(crate) fn op_channel() -> (oneshot::Sender<IoResult<HandleRef>>, OpFuture) {
    let (tx, rx) = oneshot::channel();
    let future = rx
        .map(|received| received.unwrap_or(Err(IoError::Dropped)))
        .boxed()
        .shared();
    (tx, future)
}

/// One in-flight operation.
pub(crate) struct Operation {
    pub(crate) kind: OpKind,
    /// Fulfilled exactly once by the completion path.
    pub(crate) promise: Option<oneshot::Sender<IoResult<HandleRef>>>,
    /// Whether completion may be signalled out of band rather than by the
    /// worker task's return value.
    pub(crate) deferred: bool,
    /// Dependents that arrived before this operation completed, in
    /// submission order.
    pub(crate) continuations: Vec<(OpId, BoundTask)>,
}

/// The dispatcher's authoritative index of in-flight operations.
pub(crate) struct OpTable {
    pub(crate) ops: HashMap<u64, Operation>,
    next_id: u64,
}

impl OpTable {
    pub(crate) fn new() -> Self {
        Self {
            ops: HashMap::with_capacity(OP_TABLE_INITIAL_CAPACITY),
            next_id: NO_PRECONDITION,
        }
    }

    /// Allocates the next dense identifier, skipping the reserved zero.
    pub(crate) fn allocate_id(&mut self) -> OpId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == NO_PRECONDITION {
            self.next_id = self.next_id.wrapping_add(1);
        }
        OpId::new(self.next_id)
    }

    pub(crate) fn depth(&self) -> usize {
        self.ops.len()
    }

    /// Live operations as (id, kind) pairs, sorted, for fatal
    /// diagnostics.
    pub(crate) fn live_ops(&self) -> Vec<(u64, &'static str)> {
        let mut ops: Vec<(u64, &'static str)> = self
            .ops
            .iter()
            .map(|(id, op)| (*id, op.kind.as_str()))
            .collect();
        ops.sort_unstable();
        ops
    }
}

/// A reference to a submitted operation.
///
/// Descriptors are cheap to clone; every clone shares the same underlying
/// future, and any number of consumers may await the same operation.
#[derive(Clone)]
pub struct OpRef {
    dispatcher: Arc<Dispatcher>,
    id: OpId,
    future: OpFuture,
}

impl OpRef {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, id: OpId, future: OpFuture) -> Self {
        Self {
            dispatcher,
            id,
            future,
        }
    }

    /// The operation's unique identifier.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// The dispatcher this operation was submitted to.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Waits for the operation's outcome.
    pub async fn result(&self) -> IoResult<HandleRef> {
        self.future.clone().await
    }

    /// Returns the outcome if the operation has already completed.
    pub fn try_result(&self) -> Option<IoResult<HandleRef>> {
        self.future.clone().now_or_never()
    }

    pub(crate) fn future(&self) -> OpFuture {
        self.future.clone()
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRef").field("id", &self.id).finish()
    }
}

/// Waits for every operation and collects the handles, failing on the
/// first error encountered.
pub async fn when_all(ops: &[OpRef]) -> IoResult<Vec<HandleRef>> {
    futures::future::join_all(ops.iter().map(OpRef::future))
        .await
        .into_iter()
        .collect()
}

/// Waits for every operation and returns each outcome, propagating
/// nothing.
pub async fn when_all_settled(ops: &[OpRef]) -> Vec<IoResult<HandleRef>> {
    futures::future::join_all(ops.iter().map(OpRef::future)).await
}
