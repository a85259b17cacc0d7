//! # riptide-common
//!
//! Common types, errors, and constants for the Riptide I/O engine.
//!
//! This crate provides the foundational types shared by the engine:
//!
//! - **Types**: operation identifiers (`OpId`) and kind tags (`OpKind`)
//! - **Flags**: the `FileFlags` bitfield and its force/mask arithmetic
//! - **Errors**: unified, clonable error handling with `IoError`
//! - **Constants**: engine-wide defaults and limits
//!
//! ## Example
//!
//! ```rust
//! use riptide_common::{FileFlags, IoResult, OpId};
//!
//! fn example() -> IoResult<()> {
//!     let id = OpId::new(42);
//!     assert!(id.is_valid());
//!     let flags = FileFlags::CREATE | FileFlags::WRITE;
//!     assert!(flags.contains(FileFlags::WRITE));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod flags;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{IoError, IoResult};
pub use flags::FileFlags;
pub use types::{OpId, OpKind};
