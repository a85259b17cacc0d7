//! Windows backend: `CreateFileW` flag translation and IOCP-driven
//! overlapped positional I/O.
//!
//! Handles are opened `FILE_FLAG_OVERLAPPED` and associated with one
//! completion port per dispatcher. A transfer is submitted segment by
//! segment and the submitting thread returns as soon as the OS accepts
//! the request; the dispatcher's poller thread receives completion
//! packets via `GetQueuedCompletionStatus`, issues the next segment, and
//! hands the final transfer count to the completion callback.

use std::io;
use std::iter::once;
use std::mem::zeroed;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::Path;
use std::ptr::{null, null_mut};

use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, CREATE_ALWAYS, CREATE_NEW,
    FILE_APPEND_DATA, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_NO_BUFFERING,
    FILE_FLAG_OVERLAPPED, FILE_FLAG_SEQUENTIAL_SCAN, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, SYNCHRONIZE, TRUNCATE_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

use riptide_common::FileFlags;

use crate::buffer::IoBuf;

/// The owned native resource type on this platform.
pub(crate) type OwnedNative = OwnedHandle;
/// The borrowed native resource type on this platform.
pub(crate) type RawNative = RawHandle;

/// Completion key telling the poller to exit.
const SHUTDOWN_KEY: usize = usize::MAX;

pub(crate) fn native_id(native: &OwnedNative) -> u64 {
    native.as_raw_handle() as u64
}

pub(crate) fn raw(native: &OwnedNative) -> RawNative {
    native.as_raw_handle()
}

/// Opens a file or directory with the abstract flag set translated to
/// native open parameters. Handles are always opened overlapped.
pub(crate) fn open(path: &Path, flags: FileFlags, is_dir: bool) -> io::Result<OwnedNative> {
    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(once(0)).collect();

    let mut access = 0u32;
    if flags.contains(FileFlags::APPEND) {
        access |= FILE_APPEND_DATA | SYNCHRONIZE;
    } else {
        if flags.contains(FileFlags::READ) || is_dir {
            access |= GENERIC_READ;
        }
        if flags.contains(FileFlags::WRITE) {
            access |= GENERIC_WRITE;
        }
    }

    let disposition = if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
        CREATE_NEW
    } else if flags.contains(FileFlags::CREATE) {
        CREATE_ALWAYS
    } else if flags.contains(FileFlags::TRUNCATE) {
        TRUNCATE_EXISTING
    } else {
        OPEN_EXISTING
    };

    let mut attrs = FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED;
    if flags.contains(FileFlags::WILL_BE_SEQUENTIALLY_ACCESSED) {
        attrs |= FILE_FLAG_SEQUENTIAL_SCAN;
    }
    if flags.contains(FileFlags::OS_DIRECT) {
        attrs |= FILE_FLAG_NO_BUFFERING;
    }
    if flags.contains(FileFlags::OS_SYNC) {
        attrs |= FILE_FLAG_WRITE_THROUGH;
    }
    if is_dir {
        attrs |= FILE_FLAG_BACKUP_SEMANTICS;
    }

    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            null(),
            disposition,
            attrs,
            null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

pub(crate) fn fsync(handle: RawNative) -> io::Result<()> {
    if unsafe { FlushFileBuffers(handle as HANDLE) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One dispatcher-wide I/O completion port.
pub(crate) struct Iocp {
    port: OwnedHandle,
}

impl Iocp {
    pub(crate) fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            port: unsafe { OwnedHandle::from_raw_handle(port as RawHandle) },
        })
    }

    pub(crate) fn raw(&self) -> usize {
        self.port.as_raw_handle() as usize
    }

    /// Associates a freshly opened handle with the port, so its
    /// overlapped completions arrive as packets.
    pub(crate) fn associate(&self, handle: RawNative) -> io::Result<()> {
        let res = unsafe {
            CreateIoCompletionPort(
                handle as HANDLE,
                self.port.as_raw_handle() as HANDLE,
                0,
                0,
            )
        };
        if res.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wakes the poller and tells it to exit.
    pub(crate) fn post_shutdown(&self) {
        unsafe {
            PostQueuedCompletionStatus(
                self.port.as_raw_handle() as HANDLE,
                0,
                SHUTDOWN_KEY,
                null_mut(),
            );
        }
    }
}

/// In-flight overlapped transfer state.
///
/// The `OVERLAPPED` must stay the first field: the kernel hands the
/// poller a `lpOverlapped` pointer, which is cast back to the owning
/// box. Ownership passes to the kernel at submission and returns with
/// the completion packet.
#[repr(C)]
pub(crate) struct Transfer {
    overlapped: OVERLAPPED,
    handle: usize,
    write: bool,
    segments: Vec<IoBuf>,
    index: usize,
    offset: u64,
    total: usize,
    finish: Option<Box<dyn FnOnce(io::Result<usize>) + Send + 'static>>,
}

impl Transfer {
    pub(crate) fn new(
        handle: RawNative,
        write: bool,
        segments: Vec<IoBuf>,
        offset: u64,
        finish: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> Box<Self> {
        Box::new(Self {
            overlapped: unsafe { zeroed() },
            handle: handle as usize,
            write,
            segments,
            index: 0,
            offset,
            total: 0,
            finish: Some(Box::new(finish)),
        })
    }

    fn complete(mut self: Box<Self>, result: io::Result<usize>) {
        if let Some(finish) = self.finish.take() {
            finish(result);
        }
    }
}

/// Issues the transfer's current segment and returns without waiting.
///
/// On `ERROR_IO_PENDING` (and on synchronous success, which still
/// queues a packet to the associated port) the state box is leaked to
/// the kernel; the poller reclaims it. Immediate failures invoke the
/// completion callback inline.
pub(crate) fn submit(mut transfer: Box<Transfer>) {
    loop {
        if transfer.index >= transfer.segments.len() {
            let total = transfer.total;
            transfer.complete(Ok(total));
            return;
        }
        let segment = transfer.segments[transfer.index].clone();
        let (ptr, len) = {
            let mut guard = segment.lock();
            (guard.as_mut_ptr(), guard.len())
        };
        if len == 0 {
            transfer.index += 1;
            continue;
        }

        unsafe {
            transfer.overlapped = zeroed();
            transfer.overlapped.Anonymous.Anonymous.Offset = transfer.offset as u32;
            transfer.overlapped.Anonymous.Anonymous.OffsetHigh = (transfer.offset >> 32) as u32;
        }
        let handle = transfer.handle as HANDLE;
        let write = transfer.write;
        let raw_state = Box::into_raw(transfer);
        let overlapped = unsafe { &mut (*raw_state).overlapped as *mut OVERLAPPED };

        let started = unsafe {
            if write {
                WriteFile(handle, ptr, len as u32, null_mut(), overlapped)
            } else {
                ReadFile(handle, ptr, len as u32, null_mut(), overlapped)
            }
        };
        if started == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                // No packet will be queued; reclaim the state.
                let failed = unsafe { Box::from_raw(raw_state) };
                let total = failed.total;
                if err == ERROR_HANDLE_EOF {
                    failed.complete(Ok(total));
                } else {
                    failed.complete(Err(io::Error::from_raw_os_error(err as i32)));
                }
            }
        }
        return;
    }
}

/// Completion loop for one dispatcher's port. Runs on a dedicated
/// poller thread; exits on the shutdown packet or when the port goes
/// away.
pub(crate) fn run_poller(port: usize) {
    loop {
        let mut transferred = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                port as HANDLE,
                &mut transferred,
                &mut key,
                &mut overlapped,
                INFINITE,
            )
        };

        if overlapped.is_null() {
            if key == SHUTDOWN_KEY || ok == 0 {
                return;
            }
            continue;
        }

        let error = if ok == 0 {
            Some(unsafe { GetLastError() })
        } else {
            None
        };
        let mut transfer = unsafe { Box::from_raw(overlapped.cast::<Transfer>()) };
        let n = transferred as usize;
        transfer.total += n;
        transfer.offset += n as u64;
        let segment_len = transfer.segments[transfer.index].len();

        match error {
            Some(err) if err != ERROR_HANDLE_EOF => {
                transfer.complete(Err(io::Error::from_raw_os_error(err as i32)));
            }
            Some(_) => {
                // End of file: report what has transferred so far.
                let total = transfer.total;
                transfer.complete(Ok(total));
            }
            None if n < segment_len || transfer.index + 1 == transfer.segments.len() => {
                let total = transfer.total;
                transfer.complete(Ok(total));
            }
            None => {
                transfer.index += 1;
                submit(transfer);
            }
        }
    }
}
