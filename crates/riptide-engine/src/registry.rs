//! Process-wide index of live handles by native identifier.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::handle::Handle;

/// Weak-reference index of live [`Handle`] records keyed by native
/// identifier.
///
/// The registry exists for crash-time diagnostics and external lookup; it
/// never extends a handle's lifetime. Entries are inserted when a handle
/// acquires its native resource and removed by the handle's own
/// destructor, so a dangling weak entry can only be observed in the
/// window between the last strong reference dropping and the destructor
/// running.
pub struct HandleRegistry {
    handles: Mutex<HashMap<u64, Weak<Handle>>>,
}

impl HandleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of registered handles.
    pub fn count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Looks up a live handle by native identifier.
    pub fn get(&self, native: u64) -> Option<Arc<Handle>> {
        self.handles.lock().get(&native).and_then(Weak::upgrade)
    }

    /// Registers a handle under its native identifier.
    ///
    /// A previous entry under the same identifier is replaced; the OS
    /// recycles native identifiers, and the newest owner wins.
    pub(crate) fn register(&self, native: u64, handle: &Arc<Handle>) {
        self.handles.lock().insert(native, Arc::downgrade(handle));
    }

    /// Removes a handle's entry, called from the handle's destructor.
    ///
    /// Only removes the entry if it still refers to `owner`; the native
    /// identifier may have been recycled and re-registered by a newer
    /// handle since this one closed its resource.
    pub(crate) fn unregister(&self, native: u64, owner: *const Handle) {
        let mut handles = self.handles.lock();
        if let Some(entry) = handles.get(&native) {
            if std::ptr::eq(entry.as_ptr(), owner) {
                handles.remove(&native);
            }
        }
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("count", &self.count())
            .finish()
    }
}
