//! Scatter/gather buffer segments.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// One segment of a scatter/gather buffer list.
///
/// An `IoBuf` is a cheaply-clonable, shared byte segment. Callers keep
/// clones of the segments they submit with a read or write request and
/// inspect the contents once the operation's future has resolved;
/// workers lock segments while transfers against them are issued, and an
/// in-flight request keeps its segments alive until completion.
///
/// # Example
///
/// ```rust
/// use riptide_engine::IoBuf;
///
/// let buf = IoBuf::from(vec![1u8, 2, 3]);
/// assert_eq!(buf.len(), 3);
/// assert_eq!(buf.to_vec(), vec![1, 2, 3]);
/// ```
#[derive(Clone)]
pub struct IoBuf {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl IoBuf {
    /// Creates a zero-filled segment of the given length.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// Returns the segment length in bytes.
    ///
    /// The length is fixed at construction; I/O never resizes a segment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the segment is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the segment contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Locks the segment for the duration of an OS call.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock()
    }
}

impl From<Vec<u8>> for IoBuf {
    fn from(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }
}

impl From<&[u8]> for IoBuf {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf").field("len", &self.len()).finish()
    }
}
