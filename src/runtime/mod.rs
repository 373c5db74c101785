//! Runtime system
//!
//! This module contains the task/event dependency engine and the policy
//! domains that host it: GUID naming, metadata accounting, scheduling and
//! cross-domain messaging.

pub mod cluster;
pub mod comm;
pub mod datablock;
pub mod domain;
pub mod error;
pub mod event;
pub mod finish;
pub mod guid;
pub mod memory;
pub mod metadata;
pub mod scheduler;
pub mod task;

pub use cluster::{Runtime, RuntimeStats, ShutdownReport};
pub use domain::{CreatedTask, PolicyDomain, TaskContext};
pub use error::{ErrorCategory, Result, RuntimeError};
