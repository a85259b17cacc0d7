//! File and directory open flags.

use std::fmt;

bitflags::bitflags! {
    /// Bitwise file and directory open flags.
    ///
    /// A dispatcher is constructed with a force/mask pair; the effective
    /// flags for every request are `(user & !mask) | force` (see
    /// [`FileFlags::apply`]).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileFlags: u32 {
        /// Read access.
        const READ = 1;
        /// Write access.
        const WRITE = 1 << 1;
        /// Append only.
        const APPEND = 1 << 2;
        /// Truncate an existing file to zero length.
        const TRUNCATE = 1 << 3;
        /// Open, creating if the path doesn't exist.
        const CREATE = 1 << 4;
        /// Create and open only if the path doesn't already exist.
        const CREATE_ONLY_IF_NOT_EXIST = 1 << 5;
        /// Flush unsynced writes just before the handle is closed.
        const AUTO_FLUSH = 1 << 6;
        /// The handle will be accessed strictly sequentially.
        const WILL_BE_SEQUENTIALLY_ACCESSED = 1 << 7;
        /// Bypass the OS file buffers.
        const OS_DIRECT = 1 << 16;
        /// Ask the OS to not complete writes until data reaches storage.
        const OS_SYNC = 1 << 17;
    }
}

impl FileFlags {
    /// Read and write access.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Applies a dispatcher's force/mask pair to user-supplied flags.
    ///
    /// Masked bits are stripped first, then forced bits are OR'd in.
    #[inline]
    #[must_use]
    pub fn apply(self, force: Self, mask: Self) -> Self {
        (self & !mask) | force
    }

    /// Returns true if closing this handle should flush unsynced writes.
    ///
    /// Autoflush only applies to writable handles.
    #[inline]
    #[must_use]
    pub fn wants_autoflush(self) -> bool {
        self.contains(Self::AUTO_FLUSH | Self::WRITE)
    }
}

impl Default for FileFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for FileFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_mask_arithmetic() {
        let force = FileFlags::OS_SYNC;
        let mask = FileFlags::OS_DIRECT;

        let user = FileFlags::READ | FileFlags::OS_DIRECT;
        let effective = user.apply(force, mask);

        assert!(effective.contains(FileFlags::READ));
        assert!(effective.contains(FileFlags::OS_SYNC));
        assert!(!effective.contains(FileFlags::OS_DIRECT));
    }

    #[test]
    fn test_empty_force_mask_is_identity() {
        let user = FileFlags::CREATE | FileFlags::WRITE;
        assert_eq!(
            user.apply(FileFlags::empty(), FileFlags::empty()),
            user
        );
    }

    #[test]
    fn test_autoflush_requires_write() {
        assert!(!(FileFlags::AUTO_FLUSH | FileFlags::READ).wants_autoflush());
        assert!((FileFlags::AUTO_FLUSH | FileFlags::WRITE).wants_autoflush());
    }
}
