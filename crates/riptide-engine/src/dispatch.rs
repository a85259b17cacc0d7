//! The dispatcher: batch submission, precondition chaining, and the
//! single completion path.
//!
//! Submission and completion both run under one coarse lock over the
//! operation table, so a batch appears atomic to concurrent completions
//! and the continuations of a completing operation fan out atomically
//! with its retirement. The lock is never held across anything that can
//! block: `spawn_blocking` only enqueues, and the OS calls all happen
//! inside worker tasks.

use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle as PoolHandle;
use tracing::debug;

use riptide_common::{FileFlags, IoError, IoResult, OpId, OpKind};

use crate::buffer::IoBuf;
use crate::config::DispatcherConfig;
use crate::handle::{Handle, HandleKind, HandleRef};
use crate::op::{op_channel, BoundTask, OpRef, OpTable, Operation};
use crate::registry::HandleRegistry;
use crate::request::{CompletionRequest, DataRequest, PathRequest};
use crate::sys;

/// A per-kind implementation body: takes the operation id and the
/// precondition's yielded handle, returns `(complete_now, handle)`.
type OpBody =
    Box<dyn FnOnce(OpId, Option<HandleRef>) -> IoResult<(bool, HandleRef)> + Send + 'static>;

/// Dispatches file I/O operations onto a shared worker pool, composing
/// them into DAGs connected by completion dependencies.
///
/// Every batch method takes a sequence of requests and returns a sequence
/// of [`OpRef`] descriptors of the same length and order. An operation
/// with a precondition never starts before the precondition has
/// completed; an operation whose precondition failed still runs, but
/// receives no handle and must decide its own behaviour.
///
/// # Example
///
/// ```rust,no_run
/// use riptide_engine::{DataRequest, Dispatcher, FileFlags, IoBuf, PathRequest};
///
/// # async fn example() -> riptide_engine::IoResult<()> {
/// let dispatcher = Dispatcher::from_current_runtime(FileFlags::empty(), FileFlags::empty());
///
/// let opened = dispatcher.file(vec![PathRequest::new(
///     "/tmp/data.bin",
///     FileFlags::CREATE | FileFlags::READ_WRITE,
/// )]);
/// let payload = IoBuf::from(vec![1u8, 2, 3]);
/// let written = dispatcher.write(vec![DataRequest::new(&opened[0], 0, vec![payload])]);
/// let closed = dispatcher.close(vec![written[0].clone()]);
/// closed[0].result().await?;
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    this: Weak<Dispatcher>,
    pool: PoolHandle,
    force: FileFlags,
    mask: FileFlags,
    table: Mutex<OpTable>,
    registry: Arc<HandleRegistry>,
    #[cfg(windows)]
    iocp: sys::Iocp,
    #[cfg(windows)]
    poller: Option<std::thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher executing on the given worker pool, with a
    /// force/mask flag pair applied to every request.
    ///
    /// # Panics
    ///
    /// On Windows, panics when the I/O completion port or its poller
    /// thread cannot be created.
    pub fn new(pool: PoolHandle, force: FileFlags, mask: FileFlags) -> Arc<Self> {
        #[cfg(windows)]
        let (iocp, poller) = {
            let iocp = sys::Iocp::new().expect("create I/O completion port");
            let port = iocp.raw();
            let poller = std::thread::Builder::new()
                .name("riptide-iocp".into())
                .spawn(move || sys::run_poller(port))
                .expect("spawn completion poller");
            (iocp, Some(poller))
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            force,
            mask,
            table: Mutex::new(OpTable::new()),
            registry: Arc::new(HandleRegistry::new()),
            #[cfg(windows)]
            iocp,
            #[cfg(windows)]
            poller,
        })
    }

    /// Creates a dispatcher from a [`DispatcherConfig`].
    pub fn with_config(pool: PoolHandle, config: DispatcherConfig) -> Arc<Self> {
        Self::new(pool, config.force, config.mask)
    }

    /// Creates a dispatcher executing on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime context.
    pub fn from_current_runtime(force: FileFlags, mask: FileFlags) -> Arc<Self> {
        Self::new(PoolHandle::current(), force, mask)
    }

    /// Returns request flags as they would be used after applying the
    /// force/mask pair passed at construction.
    pub fn file_flags(&self, flags: FileFlags) -> FileFlags {
        flags.apply(self.force, self.mask)
    }

    /// Returns the number of operations currently in flight.
    pub fn wait_queue_depth(&self) -> usize {
        self.table.lock().depth()
    }

    /// Returns the number of handles currently registered.
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Returns the registry of live handles.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Returns the worker pool this dispatcher executes on.
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    // ---------------------------------------------------------------
    // Batch surface
    // ---------------------------------------------------------------

    /// Schedules directory creations/opens.
    pub fn dir(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let PathRequest {
                    precondition,
                    path,
                    flags,
                } = req;
                let this = self.arc();
                let body: OpBody = Box::new(move |id, _input| this.do_dir(id, path, flags));
                self.chain_op(&mut table, OpKind::DirCreate, precondition.as_ref(), false, body)
            })
            .collect()
    }

    /// Schedules directory removals.
    pub fn rmdir(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let PathRequest {
                    precondition,
                    path,
                    flags,
                } = req;
                let this = self.arc();
                let body: OpBody = Box::new(move |id, _input| this.do_rmdir(id, path, flags));
                self.chain_op(&mut table, OpKind::DirRemove, precondition.as_ref(), false, body)
            })
            .collect()
    }

    /// Schedules file opens/creations.
    pub fn file(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let PathRequest {
                    precondition,
                    path,
                    flags,
                } = req;
                let this = self.arc();
                let body: OpBody = Box::new(move |id, _input| this.do_file(id, path, flags));
                self.chain_op(&mut table, OpKind::FileOpen, precondition.as_ref(), false, body)
            })
            .collect()
    }

    /// Schedules file removals.
    pub fn rmfile(&self, reqs: Vec<PathRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let PathRequest {
                    precondition,
                    path,
                    flags,
                } = req;
                let this = self.arc();
                let body: OpBody = Box::new(move |id, _input| this.do_rmfile(id, path, flags));
                self.chain_op(&mut table, OpKind::FileRemove, precondition.as_ref(), false, body)
            })
            .collect()
    }

    /// Schedules syncs of the handles produced by the given operations.
    pub fn sync(&self, ops: Vec<OpRef>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        ops.into_iter()
            .map(|op| {
                let this = self.arc();
                let body: OpBody = Box::new(move |id, input| this.do_sync(id, input));
                self.chain_op(&mut table, OpKind::Sync, Some(&op), false, body)
            })
            .collect()
    }

    /// Schedules closes of the handles produced by the given operations.
    ///
    /// On POSIX, closing a file that has ever been fsynced transparently
    /// chains an open → sync → close of the containing directory; the
    /// returned descriptor stands for the final directory-close, and
    /// resolves to its handle once the directory close has completed.
    pub fn close(&self, ops: Vec<OpRef>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        ops.into_iter()
            .map(|op| {
                let this = self.arc();
                let body: OpBody = Box::new(move |id, input| this.do_close(id, input));
                self.chain_op(&mut table, OpKind::Close, Some(&op), cfg!(unix), body)
            })
            .collect()
    }

    /// Schedules positional scatter reads.
    pub fn read(&self, reqs: Vec<DataRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let DataRequest {
                    precondition,
                    offset,
                    buffers,
                } = req;
                let this = self.arc();
                let body: OpBody =
                    Box::new(move |id, input| this.do_read(id, input, offset, buffers));
                self.chain_op(&mut table, OpKind::Read, Some(&precondition), cfg!(windows), body)
            })
            .collect()
    }

    /// Schedules positional gather writes.
    pub fn write(&self, reqs: Vec<DataRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let DataRequest {
                    precondition,
                    offset,
                    buffers,
                } = req;
                let this = self.arc();
                let body: OpBody =
                    Box::new(move |id, input| this.do_write(id, input, offset, buffers));
                self.chain_op(&mut table, OpKind::Write, Some(&precondition), cfg!(windows), body)
            })
            .collect()
    }

    /// Schedules caller-supplied completion callbacks.
    pub fn completion(&self, reqs: Vec<CompletionRequest>) -> Vec<OpRef> {
        let mut table = self.table.lock();
        reqs.into_iter()
            .map(|req| {
                let CompletionRequest {
                    precondition,
                    deferred,
                    callback,
                } = req;
                let body: OpBody = Box::new(move |id, input| {
                    let handle = callback(id, input)?;
                    Ok((!deferred, handle))
                });
                self.chain_op(
                    &mut table,
                    OpKind::UserCompletion,
                    precondition.as_ref(),
                    deferred,
                    body,
                )
            })
            .collect()
    }

    /// Finalises a deferred operation with the supplied outcome.
    ///
    /// Only valid for operations submitted with deferred completion
    /// (deferred user completions, and platform read/write completions).
    pub fn complete(&self, id: OpId, result: IoResult<HandleRef>) -> IoResult<()> {
        let mut table = self.table.lock();
        match table.ops.get(&id.as_u64()) {
            None => Err(IoError::UnknownOp { id: id.as_u64() }),
            Some(op) if !op.deferred => Err(IoError::NotDeferred { id: id.as_u64() }),
            Some(_) => {
                self.finish_locked(&mut table, id, result);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------
    // Submission and completion internals
    // ---------------------------------------------------------------

    fn arc(&self) -> Arc<Self> {
        self.this
            .upgrade()
            .expect("dispatcher self-reference valid while borrowed")
    }

    /// Creates one operation record under the table lock.
    ///
    /// If the precondition is still in flight the bound task is appended
    /// to its continuations; otherwise the precondition's yielded handle
    /// is bound immediately and the task enqueued on the worker pool.
    fn chain_op(
        &self,
        table: &mut OpTable,
        kind: OpKind,
        precondition: Option<&OpRef>,
        deferred: bool,
        body: OpBody,
    ) -> OpRef {
        let id = table.allocate_id();
        let (promise, future) = op_channel();

        let this = self.arc();
        let mut task: Option<BoundTask> = Some(Box::new(move |input| this.run_op(id, input, body)));

        let mut chained = false;
        if let Some(pre) = precondition {
            // Identifiers are only meaningful within their own dispatcher.
            let same_dispatcher = std::ptr::eq(Arc::as_ptr(pre.dispatcher()), self);
            if same_dispatcher && pre.id().is_valid() {
                if let Some(dep) = table.ops.get_mut(&pre.id().as_u64()) {
                    let bound = task.take().expect("task not yet consumed");
                    dep.continuations.push((id, bound));
                    chained = true;
                }
            }
        }
        if let Some(task) = task {
            // Precondition absent or already retired from the table: its
            // future is terminal, so extracting the handle cannot block.
            let input = precondition
                .and_then(|pre| pre.try_result())
                .and_then(Result::ok);
            self.pool.spawn_blocking(move || task(input));
        }

        debug!(id = id.as_u64(), kind = %kind, chained, "operation submitted");
        table.ops.insert(
            id.as_u64(),
            Operation {
                kind,
                promise: Some(promise),
                deferred,
                continuations: Vec::new(),
            },
        );
        OpRef::new(self.arc(), id, future)
    }

    /// Completion trampoline. Runs in a worker; routes the body's return
    /// value or error through the completion path.
    fn run_op(self: Arc<Self>, id: OpId, input: Option<HandleRef>, body: OpBody) {
        match body(id, input) {
            Ok((true, handle)) => self.complete_op(id, Ok(handle)),
            Ok((false, _handle)) => {
                // Completion arrives out of band. The operation may even
                // have been finalised already by a completion racing with
                // this return.
                #[cfg(debug_assertions)]
                {
                    let table = self.table.lock();
                    if let Some(op) = table.ops.get(&id.as_u64()) {
                        assert!(
                            op.deferred,
                            "operation {id} deferred its completion but was not submitted deferred"
                        );
                    }
                }
            }
            Err(error) => self.complete_op(id, Err(error)),
        }
    }

    fn complete_op(&self, id: OpId, result: IoResult<HandleRef>) {
        let mut table = self.table.lock();
        self.finish_locked(&mut table, id, result);
    }

    /// The single completion path: releases continuations in insertion
    /// order, fulfils the promise, and retires the operation, all under
    /// the table lock.
    ///
    /// # Panics
    ///
    /// An identifier absent from the table is an internal invariant
    /// violation and panics with a snapshot of the live operation ids.
    fn finish_locked(&self, table: &mut OpTable, id: OpId, result: IoResult<HandleRef>) {
        let continuations = match table.ops.get_mut(&id.as_u64()) {
            Some(op) => mem::take(&mut op.continuations),
            None => panic!(
                "operation {id} missing from the operation table; live operations: {:?}",
                table.live_ops()
            ),
        };
        let handle = result.as_ref().ok().cloned();
        for (dep_id, task) in continuations {
            assert!(
                table.ops.contains_key(&dep_id.as_u64()),
                "continuation {dep_id} missing from the operation table; live operations: {:?}",
                table.live_ops()
            );
            debug!(
                id = dep_id.as_u64(),
                precondition = id.as_u64(),
                "continuation released"
            );
            let input = handle.clone();
            self.pool.spawn_blocking(move || task(input));
        }
        let op = table
            .ops
            .remove(&id.as_u64())
            .expect("operation located above");
        if let Some(promise) = op.promise {
            // The receiver is gone when every descriptor was dropped
            // without being awaited; that failure stays silent.
            let _ = promise.send(result);
        }
        debug!(id = id.as_u64(), "operation retired");
    }

    // ---------------------------------------------------------------
    // Per-kind implementations (run in workers)
    // ---------------------------------------------------------------

    fn do_dir(&self, _id: OpId, path: PathBuf, flags: FileFlags) -> IoResult<(bool, HandleRef)> {
        let mut flags = self.file_flags(flags);
        if flags.contains(FileFlags::CREATE) {
            let mut builder = std::fs::DirBuilder::new();
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(riptide_common::DEFAULT_DIR_MODE);
            }
            if let Err(e) = builder.create(&path) {
                let tolerated = e.kind() == std::io::ErrorKind::AlreadyExists
                    && !flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST);
                if !tolerated {
                    return Err(IoError::from_io_with_path(e, &path));
                }
            }
            flags.remove(FileFlags::CREATE | FileFlags::CREATE_ONLY_IF_NOT_EXIST);
        }
        if let Ok(meta) = std::fs::metadata(&path) {
            if !meta.is_dir() {
                return Err(IoError::not_a_directory(&path));
            }
        }
        if flags.contains(FileFlags::READ) {
            let (done, handle) = self.open_native(path, flags, true)?;
            // Directory entries only reach storage when the directory
            // itself is fsynced; the marker makes a chained sync issue
            // the call.
            #[cfg(unix)]
            handle.mark_dir_unsynced();
            Ok((done, handle))
        } else {
            Ok((true, Handle::synthetic(path, flags)))
        }
    }

    fn do_rmdir(&self, _id: OpId, path: PathBuf, flags: FileFlags) -> IoResult<(bool, HandleRef)> {
        let flags = self.file_flags(flags);
        std::fs::remove_dir(&path).map_err(|e| IoError::from_io_with_path(e, &path))?;
        Ok((true, Handle::synthetic(path, flags)))
    }

    fn do_file(&self, _id: OpId, path: PathBuf, flags: FileFlags) -> IoResult<(bool, HandleRef)> {
        let flags = self.file_flags(flags);
        self.open_native(path, flags, false)
    }

    fn do_rmfile(&self, _id: OpId, path: PathBuf, flags: FileFlags) -> IoResult<(bool, HandleRef)> {
        let flags = self.file_flags(flags);
        std::fs::remove_file(&path).map_err(|e| IoError::from_io_with_path(e, &path))?;
        Ok((true, Handle::synthetic(path, flags)))
    }

    fn open_native(
        &self,
        path: PathBuf,
        flags: FileFlags,
        is_dir: bool,
    ) -> IoResult<(bool, HandleRef)> {
        let native =
            sys::open(&path, flags, is_dir).map_err(|e| IoError::from_io_with_path(e, &path))?;
        #[cfg(windows)]
        self.iocp
            .associate(sys::raw(&native))
            .map_err(|e| IoError::from_io_with_path(e, &path))?;
        let kind = if is_dir {
            HandleKind::Directory
        } else {
            HandleKind::File
        };
        let handle = Handle::from_native(path, flags, kind, native, Arc::clone(&self.registry));
        Ok((true, handle))
    }

    fn do_sync(&self, _id: OpId, input: Option<HandleRef>) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "sync" })?;
        handle.sync()?;
        Ok((true, handle))
    }

    fn do_close(&self, _id: OpId, input: Option<HandleRef>) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "close" })?;
        #[cfg(unix)]
        let chain_parent = handle.kind() == HandleKind::File && handle.ever_fsynced();
        handle.close_native()?;
        #[cfg(unix)]
        if chain_parent {
            self.chain_parent_dir_sync(_id, &handle);
            return Ok((false, handle));
        }
        Ok((true, handle))
    }

    /// Appends the containing-directory open → sync → close chain after a
    /// file close, fulfilling the close's promise with the directory
    /// close's handle once it has completed. The returned close
    /// descriptor thereby stands for the final directory-close, not the
    /// file-close. On several POSIX filesystems a file's directory entry
    /// is not durable until the containing directory is itself synced.
    /// Single level only: directory handles never re-chain.
    #[cfg(unix)]
    fn chain_parent_dir_sync(&self, close_id: OpId, file_handle: &HandleRef) {
        let parent = match file_handle.path().parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        debug!(
            id = close_id.as_u64(),
            parent = %parent.display(),
            "chaining containing-directory sync"
        );
        let opened = self.dir(vec![PathRequest::new(parent, FileFlags::READ)]);
        let synced = self.sync(vec![opened[0].clone()]);
        let closed = self.close(vec![synced[0].clone()]);

        let this = self.arc();
        let finalise = CompletionRequest::new(Some(closed[0].clone()), move |_cid, dir_result| {
            let outcome = dir_result
                .ok_or_else(|| IoError::task("containing-directory sync chain failed"));
            if let Err(e) = this.complete(close_id, outcome.clone()) {
                tracing::warn!(id = close_id.as_u64(), error = %e, "close finalisation failed");
            }
            outcome
        });
        self.completion(vec![finalise]);
    }

    #[cfg(unix)]
    fn do_read(
        &self,
        _id: OpId,
        input: Option<HandleRef>,
        offset: u64,
        buffers: Vec<IoBuf>,
    ) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "read" })?;
        let raw = handle.raw()?;
        let n = sys::read_at(raw, &buffers, offset)
            .map_err(|e| IoError::from_io_with_path(e, handle.path()))?;
        handle.add_read_bytes(n as u64);
        Ok((true, handle))
    }

    #[cfg(unix)]
    fn do_write(
        &self,
        _id: OpId,
        input: Option<HandleRef>,
        offset: u64,
        buffers: Vec<IoBuf>,
    ) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "write" })?;
        let raw = handle.raw()?;
        let expected: usize = buffers.iter().map(IoBuf::len).sum();
        let n = sys::write_at(raw, &buffers, offset)
            .map_err(|e| IoError::from_io_with_path(e, handle.path()))?;
        handle.add_written_bytes(n as u64);
        if n != expected {
            return Err(IoError::short_write(expected, n));
        }
        Ok((true, handle))
    }

    /// Windows read: submits the overlapped transfers to the completion
    /// port and returns without waiting. The poller thread invokes the
    /// completion path when the final packet arrives.
    #[cfg(windows)]
    fn do_read(
        &self,
        id: OpId,
        input: Option<HandleRef>,
        offset: u64,
        buffers: Vec<IoBuf>,
    ) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "read" })?;
        let raw = handle.raw()?;
        let this = self.arc();
        let agent = Arc::clone(&handle);
        let transfer = sys::Transfer::new(raw, false, buffers, offset, move |result| {
            let outcome = match result {
                Ok(n) => {
                    agent.add_read_bytes(n as u64);
                    Ok(Arc::clone(&agent))
                }
                Err(e) => Err(IoError::from_io_with_path(e, agent.path())),
            };
            this.complete_op(id, outcome);
        });
        sys::submit(transfer);
        Ok((false, handle))
    }

    #[cfg(windows)]
    fn do_write(
        &self,
        id: OpId,
        input: Option<HandleRef>,
        offset: u64,
        buffers: Vec<IoBuf>,
    ) -> IoResult<(bool, HandleRef)> {
        let handle = input.ok_or(IoError::MissingInput { operation: "write" })?;
        let raw = handle.raw()?;
        let expected: usize = buffers.iter().map(IoBuf::len).sum();
        let this = self.arc();
        let agent = Arc::clone(&handle);
        let transfer = sys::Transfer::new(raw, true, buffers, offset, move |result| {
            let outcome = match result {
                Ok(n) => {
                    agent.add_written_bytes(n as u64);
                    if n == expected {
                        Ok(Arc::clone(&agent))
                    } else {
                        Err(IoError::short_write(expected, n))
                    }
                }
                Err(e) => Err(IoError::from_io_with_path(e, agent.path())),
            };
            this.complete_op(id, outcome);
        });
        sys::submit(transfer);
        Ok((false, handle))
    }
}

#[cfg(windows)]
impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.iocp.post_shutdown();
        if let Some(poller) = self.poller.take() {
            // The last reference can be dropped from a completion
            // callback running on the poller itself; it cannot join its
            // own thread.
            if poller.thread().id() != std::thread::current().id() {
                let _ = poller.join();
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("force", &self.force)
            .field("mask", &self.mask)
            .field("wait_queue_depth", &self.wait_queue_depth())
            .field("handles", &self.count())
            .finish()
    }
}
