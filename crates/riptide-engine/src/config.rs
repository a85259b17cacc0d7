//! Dispatcher configuration.

use riptide_common::FileFlags;

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
///
/// The force/mask pair rewrites the flags of every request submitted to
/// the dispatcher: masked bits are stripped, forced bits are OR'd in.
///
/// # Example
///
/// ```rust
/// use riptide_engine::{DispatcherConfig, FileFlags};
///
/// let config = DispatcherConfig::new()
///     .with_force_flags(FileFlags::OS_SYNC)
///     .with_mask_flags(FileFlags::OS_DIRECT);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Flags OR'd into every request.
    pub force: FileFlags,
    /// Flags stripped from every request.
    pub mask: FileFlags,
}

impl DispatcherConfig {
    /// Creates a configuration that leaves request flags untouched.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flags OR'd into every request.
    #[must_use]
    pub fn with_force_flags(mut self, force: FileFlags) -> Self {
        self.force = force;
        self
    }

    /// Sets the flags stripped from every request.
    #[must_use]
    pub fn with_mask_flags(mut self, mask: FileFlags) -> Self {
        self.mask = mask;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_identity() {
        let config = DispatcherConfig::new();
        assert!(config.force.is_empty());
        assert!(config.mask.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = DispatcherConfig::new()
            .with_force_flags(FileFlags::AUTO_FLUSH)
            .with_mask_flags(FileFlags::OS_DIRECT);
        assert_eq!(config.force, FileFlags::AUTO_FLUSH);
        assert_eq!(config.mask, FileFlags::OS_DIRECT);
    }
}
