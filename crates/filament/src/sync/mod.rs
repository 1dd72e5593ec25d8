//! Synchronization primitives for OS threads.
//!
//! The lock module provides one locking contract over several strategies
//! (parking, spinning, compare-and-swap, no-op) plus a read-write lock.
//! The semaphore module provides a counting semaphore used for startup
//! handshakes and test sequencing.

pub mod lock;
pub mod semaphore;

pub use lock::{CasLock, Mutex, NullLock, RawLock, RwLock, ScopedLock, SpinLock};
pub use semaphore::Semaphore;
