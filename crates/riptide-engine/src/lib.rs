//! # riptide-engine
//!
//! An asynchronous, portable file I/O engine: a dispatcher that accepts
//! declarative operation requests against filesystem paths and open
//! handles, schedules them on a shared worker pool, and composes them
//! into DAGs of operations connected by completion dependencies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Dispatcher                   │
//! │  dir / rmdir / file / rmfile / sync / close  │
//! │        read / write / completion             │
//! └──────────────────────────────────────────────┘
//!           │                        │
//!           ▼                        ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │   Operation Table   │  │   Handle Registry   │
//! │ (in-flight ops and  │  │ (weak index of live │
//! │   continuations)    │  │  handles by native  │
//! │                     │  │     identifier)     │
//! └─────────────────────┘  └─────────────────────┘
//!           │
//!           ▼
//!   shared worker pool (tokio blocking pool)
//! ```
//!
//! Each submitted operation yields an [`OpRef`] descriptor carrying a
//! shareable future. Operations may name a previously submitted
//! operation as their precondition; a dependent never starts before its
//! precondition completes, and a failed precondition hands the dependent
//! no handle rather than cancelling it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use riptide_engine::{DataRequest, Dispatcher, FileFlags, IoBuf, PathRequest};
//!
//! async fn example() -> riptide_engine::IoResult<()> {
//!     let dispatcher =
//!         Dispatcher::from_current_runtime(FileFlags::empty(), FileFlags::empty());
//!
//!     let dir = dispatcher.dir(vec![PathRequest::new("data", FileFlags::CREATE)]);
//!     let file = dispatcher.file(vec![PathRequest::after(
//!         &dir[0],
//!         "data/blob.bin",
//!         FileFlags::CREATE | FileFlags::READ_WRITE | FileFlags::AUTO_FLUSH,
//!     )]);
//!     let written = dispatcher.write(vec![DataRequest::new(
//!         &file[0],
//!         0,
//!         vec![IoBuf::from(vec![1u8, 2, 3])],
//!     )]);
//!     let closed = dispatcher.close(vec![written[0].clone()]);
//!     closed[0].result().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod buffer;
mod config;
mod dispatch;
mod handle;
mod op;
mod registry;
mod request;
mod sys;

pub use buffer::IoBuf;
pub use config::DispatcherConfig;
pub use dispatch::Dispatcher;
pub use handle::{Handle, HandleKind, HandleRef};
pub use op::{when_all, when_all_settled, OpRef};
pub use registry::HandleRegistry;
pub use request::{CompletionFn, CompletionRequest, DataRequest, PathRequest};

// Re-export the foundational types alongside the engine surface.
pub use riptide_common::{FileFlags, IoError, IoResult, OpId, OpKind};
