//! Filament: stackful fibers and an N:M cooperative scheduler.
//!
//! This crate provides user-level cooperative multitasking:
//! - **Fibers**: stackful coroutines with explicit yield points (`fiber` module)
//! - **Scheduler**: callbacks and fibers over a worker thread pool (`scheduler` module)
//! - **Threads**: a named OS-thread wrapper with a startup handshake (`thread` module)
//! - **Sync**: lock strategies and a counting semaphore (`sync` module)
//! - **Config**: a typed configuration store with change listeners (`config` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use filament::Scheduler;
//!
//! let mut scheduler = Scheduler::new(4, false, "pool");
//! scheduler.start();
//! scheduler.schedule(|| {
//!     println!("running on a worker");
//! });
//! scheduler.stop();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Typed configuration store with change notification
pub mod config;

/// Stackful fibers: creation, switching, and lifecycle
pub mod fiber;

/// N:M scheduler over a worker thread pool
pub mod scheduler;

/// Locks and semaphores for OS threads
pub mod sync;

/// Named OS-thread wrapper with a startup handshake
pub mod thread;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{Config, ConfigError, ConfigValue, ConfigVar};
pub use fiber::{
    current_fiber_id, total_fibers, yield_hold, yield_ready, Fiber, FiberError, FiberRef,
    FiberState,
};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle};
pub use sync::{CasLock, Mutex, NullLock, RawLock, RwLock, ScopedLock, Semaphore, SpinLock};
pub use thread::{os_thread_id, Thread, ThreadError};
