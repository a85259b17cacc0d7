//! POSIX backend: `open(2)` flag translation and vectored positional I/O.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use riptide_common::{FileFlags, DEFAULT_FILE_MODE};

use crate::buffer::IoBuf;

/// The owned native resource type on this platform.
pub(crate) type OwnedNative = OwnedFd;
/// The borrowed native resource type on this platform.
pub(crate) type RawNative = RawFd;

pub(crate) fn native_id(native: &OwnedNative) -> u64 {
    native.as_raw_fd() as u64
}

pub(crate) fn raw(native: &OwnedNative) -> RawNative {
    native.as_raw_fd()
}

/// Opens a file or directory with the abstract flag set translated to
/// native open parameters.
pub(crate) fn open(path: &Path, flags: FileFlags, is_dir: bool) -> io::Result<OwnedNative> {
    let mut opts = OpenOptions::new();
    opts.read(flags.contains(FileFlags::READ) || is_dir)
        .write(flags.contains(FileFlags::WRITE))
        .append(flags.contains(FileFlags::APPEND))
        .truncate(flags.contains(FileFlags::TRUNCATE));
    if flags.contains(FileFlags::CREATE_ONLY_IF_NOT_EXIST) {
        opts.create_new(true);
    } else if flags.contains(FileFlags::CREATE) {
        opts.create(true);
    }
    opts.mode(DEFAULT_FILE_MODE);

    let mut custom = 0;
    #[cfg(target_os = "linux")]
    if flags.contains(FileFlags::OS_DIRECT) {
        custom |= libc::O_DIRECT;
    }
    if flags.contains(FileFlags::OS_SYNC) {
        custom |= libc::O_SYNC;
    }
    if is_dir {
        custom |= libc::O_DIRECTORY;
    }
    opts.custom_flags(custom);

    Ok(opts.open(path)?.into())
}

/// Reads into the segments at `offset` with a single `preadv(2)` call.
pub(crate) fn read_at(fd: RawFd, bufs: &[IoBuf], offset: u64) -> io::Result<usize> {
    let mut guards: Vec<_> = bufs.iter().map(IoBuf::lock).collect();
    let iov: Vec<libc::iovec> = guards
        .iter_mut()
        .map(|g| libc::iovec {
            iov_base: g.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: g.len(),
        })
        .collect();
    let n = unsafe {
        libc::preadv(
            fd,
            iov.as_ptr(),
            iov.len() as libc::c_int,
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Writes the segments at `offset` with a single `pwritev(2)` call.
pub(crate) fn write_at(fd: RawFd, bufs: &[IoBuf], offset: u64) -> io::Result<usize> {
    let guards: Vec<_> = bufs.iter().map(IoBuf::lock).collect();
    let iov: Vec<libc::iovec> = guards
        .iter()
        .map(|g| libc::iovec {
            iov_base: g.as_ptr() as *mut libc::c_void,
            iov_len: g.len(),
        })
        .collect();
    let n = unsafe {
        libc::pwritev(
            fd,
            iov.as_ptr(),
            iov.len() as libc::c_int,
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn fsync(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fsync(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
