//! Operation identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation identifier - uniquely identifies a submitted operation.
///
/// Identifiers are dense non-zero integers assigned from a monotonic
/// counter and are never reused within a dispatcher's lifetime. The value
/// 0 is reserved to mean "no precondition".
///
/// # Example
///
/// ```rust
/// use riptide_common::OpId;
///
/// let id = OpId::new(42);
/// assert_eq!(id.as_u64(), 42);
/// assert!(!OpId::NONE.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct OpId(u64);

impl OpId {
    /// The reserved identifier meaning "no precondition".
    pub const NONE: Self = Self(0);

    /// Creates a new `OpId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this identifier refers to an actual operation.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NONE.0
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "OpId(NONE)")
        } else {
            write!(f, "OpId({})", self.0)
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<OpId> for u64 {
    #[inline]
    fn from(id: OpId) -> Self {
        id.0
    }
}
