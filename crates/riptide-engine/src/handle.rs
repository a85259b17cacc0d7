//! Owning wrappers over native file and directory resources.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::warn;

use riptide_common::{FileFlags, IoError, IoResult};

use crate::registry::HandleRegistry;
use crate::sys;

/// A shared reference to a [`Handle`] record.
pub type HandleRef = Arc<Handle>;

/// What a handle's native resource refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A regular file.
    File,
    /// A directory opened for syncing or enumeration.
    Directory,
    /// A path-only record with no native resource (produced by removals
    /// and directory creations that were not asked to open).
    Synthetic,
}

/// An owning wrapper over one native file or directory resource.
///
/// Handles are shared among every operation that takes them as a
/// precondition. The per-handle byte counters are plain atomics updated
/// by whichever worker is executing I/O against the handle; the operation
/// graph serialises those workers unless the caller explicitly forks
/// independent chains.
pub struct Handle {
    path: PathBuf,
    flags: FileFlags,
    kind: HandleKind,
    autoflush: bool,
    opened: SystemTime,
    native: Mutex<Option<sys::OwnedNative>>,
    native_id: Option<u64>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    synced_watermark: AtomicU64,
    ever_fsynced: AtomicBool,
    registry: Option<Arc<HandleRegistry>>,
}

impl Handle {
    /// Creates a path-only record with no native resource.
    pub(crate) fn synthetic(path: PathBuf, flags: FileFlags) -> HandleRef {
        Arc::new(Self {
            path,
            flags,
            kind: HandleKind::Synthetic,
            autoflush: false,
            opened: SystemTime::now(),
            native: Mutex::new(None),
            native_id: None,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            synced_watermark: AtomicU64::new(0),
            ever_fsynced: AtomicBool::new(false),
            registry: None,
        })
    }

    /// Wraps a freshly opened native resource and registers it.
    pub(crate) fn from_native(
        path: PathBuf,
        flags: FileFlags,
        kind: HandleKind,
        native: sys::OwnedNative,
        registry: Arc<HandleRegistry>,
    ) -> HandleRef {
        let native_id = sys::native_id(&native);
        let handle = Arc::new(Self {
            path,
            flags,
            kind,
            autoflush: flags.wants_autoflush(),
            opened: SystemTime::now(),
            native: Mutex::new(Some(native)),
            native_id: Some(native_id),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            synced_watermark: AtomicU64::new(0),
            ever_fsynced: AtomicBool::new(false),
            registry: Some(registry),
        });
        handle
            .registry
            .as_ref()
            .expect("registry just installed")
            .register(native_id, &handle);
        handle
    }

    /// Returns the path this handle was opened against.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the effective flags the handle was opened with.
    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    /// Returns what the native resource refers to.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Returns when this handle was opened.
    pub fn opened(&self) -> SystemTime {
        self.opened
    }

    /// Returns the native identifier, if a native resource is attached.
    ///
    /// On POSIX this is the file descriptor; on Windows the HANDLE value.
    pub fn native(&self) -> Option<u64> {
        self.native_id
    }

    /// Returns how many bytes have been read through this handle.
    pub fn read_count(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Returns how many bytes have been written through this handle.
    pub fn write_count(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Returns how many bytes have been written since the last sync.
    pub fn write_count_since_sync(&self) -> u64 {
        self.write_count()
            .saturating_sub(self.synced_watermark.load(Ordering::Acquire))
    }

    pub(crate) fn add_read_bytes(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn add_written_bytes(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    /// Marks a directory handle as carrying one unsynced byte.
    ///
    /// Directory entries on POSIX filesystems only reach storage when the
    /// directory itself is fsynced; the marker makes a chained sync
    /// operation actually issue the fsync.
    #[cfg(unix)]
    pub(crate) fn mark_dir_unsynced(&self) {
        self.bytes_written.store(1, Ordering::Release);
    }

    pub(crate) fn ever_fsynced(&self) -> bool {
        self.ever_fsynced.load(Ordering::Acquire)
    }

    /// Returns the raw native resource for an OS call.
    pub(crate) fn raw(&self) -> IoResult<sys::RawNative> {
        self.native
            .lock()
            .as_ref()
            .map(sys::raw)
            .ok_or_else(|| IoError::handle_closed(&self.path))
    }

    /// Flushes written data to storage and advances the sync watermark.
    ///
    /// No OS call is made when nothing has been written since the last
    /// sync. The handle is marked as fsynced either way.
    pub(crate) fn sync(&self) -> IoResult<()> {
        self.flush_unsynced()?;
        self.ever_fsynced.store(true, Ordering::Release);
        Ok(())
    }

    /// Releases the native resource, flushing first under autoflush.
    ///
    /// The registry entry is left in place; it is removed by this
    /// record's destructor, once the last strong reference drops.
    pub(crate) fn close_native(&self) -> IoResult<()> {
        if self.autoflush && self.write_count_since_sync() > 0 {
            self.flush_unsynced()?;
        }
        let native = self.native.lock().take();
        match native {
            Some(resource) => {
                drop(resource);
                Ok(())
            }
            None => Err(IoError::handle_closed(&self.path)),
        }
    }

    fn flush_unsynced(&self) -> IoResult<()> {
        let pending = self.write_count_since_sync();
        if pending == 0 {
            return Ok(());
        }
        let raw = self.raw()?;
        sys::fsync(raw).map_err(|e| IoError::from_io_with_path(e, &self.path))?;
        self.synced_watermark.fetch_add(pending, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(resource) = self.native.get_mut().take() {
            if self.autoflush && self.write_count_since_sync() > 0 {
                if let Err(e) = sys::fsync(sys::raw(&resource)) {
                    warn!(path = %self.path.display(), error = %e, "autoflush on drop failed");
                }
            }
            drop(resource);
        }
        if let (Some(id), Some(registry)) = (self.native_id, self.registry.as_ref()) {
            registry.unregister(id, self as *const _);
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("native", &self.native_id)
            .field("written", &self.write_count())
            .finish()
    }
}
