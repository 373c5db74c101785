//! flowrt: an asynchronous dataflow task runtime
//!
//! Work is expressed as tasks that declare up front the events and
//! data-blocks they depend on. The runtime tracks readiness and hands each
//! task to a worker exactly once, when its last dependence resolves.
//!
//! # Example
//!
//! ```no_run
//! use flowrt::{task_fn, DepCount, EventKind, Guid, Runtime, TaskBuilder};
//!
//! fn main() -> flowrt::Result<()> {
//!     let runtime = Runtime::with_defaults()?;
//!     let domain = runtime.root();
//!     let hello = domain.template_create(
//!         "hello",
//!         task_fn(|_, _, _| Guid::NULL),
//!         0,
//!         DepCount::Fixed(0),
//!     )?;
//!     let created = domain.create_task(TaskBuilder::new(hello).output(EventKind::Sticky))?;
//!     runtime.wait(created.output, None)?;
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::datablock::{AccessMode, DbView};
pub use runtime::event::{EventKind, EventParams, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
pub use runtime::guid::{DomainId, Guid, GuidKind, GuidRange, LabelMode, ProviderKind};
pub use runtime::task::{task_fn, DepCount, DepValue, SlotStatus, TaskBuilder, TaskFn, TaskPriority};
pub use runtime::{
    CreatedTask, ErrorCategory, PolicyDomain, Result, Runtime, RuntimeError, RuntimeStats,
    ShutdownReport, TaskContext,
};
pub use util::config::RuntimeConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "flowrt";
