//! N:M cooperative scheduler.
//!
//! Distributes callbacks and fibers over a pool of worker threads, with
//! optional participation of the caller's thread and per-task worker
//! affinity.

mod task;
#[allow(clippy::module_inception)]
mod scheduler;

pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle};
