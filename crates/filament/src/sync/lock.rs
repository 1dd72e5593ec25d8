//! Locking strategies behind a single contract.
//!
//! `RawLock` is the contract; `Mutex`, `SpinLock`, `CasLock` and `NullLock`
//! are the strategies. `ScopedLock` is the guard that releases on every exit
//! path. Code that needs to swap strategies takes a generic `L: RawLock`
//! parameter rather than a trait object, so the choice is resolved at
//! compile time.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex as _;

/// A raw lock: acquire and release with no data attached.
///
/// All strategies are usable from multiple threads through a shared
/// reference. Pair acquisition with [`ScopedLock`] so release cannot be
/// forgotten.
pub trait RawLock {
    /// Block until the lock is acquired.
    fn lock(&self);

    /// Try to acquire the lock without blocking. Returns `true` on success.
    fn try_lock(&self) -> bool;

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock.
    unsafe fn unlock(&self);
}

/// A blocking mutual-exclusion lock. Parks the thread while contended.
pub struct Mutex {
    raw: parking_lot::RawMutex,
}

impl Mutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            raw: parking_lot::RawMutex::INIT,
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for Mutex {
    fn lock(&self) {
        self.raw.lock();
    }

    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    unsafe fn unlock(&self) {
        self.raw.unlock();
    }
}

/// A busy-waiting lock. Suited to critical sections of a few instructions;
/// under longer contention it burns the CPU that `Mutex` would yield.
#[derive(Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Create an unlocked spin lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for SpinLock {
    fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A lock acquired with a compare-exchange loop.
#[derive(Default)]
pub struct CasLock {
    locked: AtomicBool,
}

impl CasLock {
    /// Create an unlocked CAS lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for CasLock {
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A lock that never blocks. For single-threaded configurations where the
/// locking overhead is not wanted; it provides no exclusion.
#[derive(Default)]
pub struct NullLock;

impl NullLock {
    /// Create a null lock.
    pub const fn new() -> Self {
        Self
    }
}

impl RawLock for NullLock {
    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    unsafe fn unlock(&self) {}
}

/// RAII guard over any [`RawLock`]. Acquires on construction, releases on
/// drop, including during unwinding.
pub struct ScopedLock<'a, L: RawLock> {
    lock: &'a L,
}

impl<'a, L: RawLock> ScopedLock<'a, L> {
    /// Acquire `lock`, blocking until it is held.
    pub fn new(lock: &'a L) -> Self {
        lock.lock();
        Self { lock }
    }

    /// Acquire `lock` without blocking; `None` if it is contended.
    pub fn try_new(lock: &'a L) -> Option<Self> {
        if lock.try_lock() {
            Some(Self { lock })
        } else {
            None
        }
    }
}

impl<L: RawLock> Drop for ScopedLock<'_, L> {
    fn drop(&mut self) {
        // The guard's existence proves the lock is held.
        unsafe { self.lock.unlock() };
    }
}

/// A reader-writer lock with guard-based access.
///
/// Any number of readers share the lock; a writer excludes everyone.
pub struct RwLock<T> {
    inner: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    /// Create a lock wrapping `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: parking_lot::RwLock::new(value),
        }
    }

    /// Acquire shared read access.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquire exclusive write access.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Try to acquire read access without blocking.
    pub fn try_read(&self) -> Option<parking_lot::RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Try to acquire write access without blocking.
    pub fn try_write(&self) -> Option<parking_lot::RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    /// Consume the lock and return the wrapped value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    // A non-atomic read-modify-write under the lock; lost updates show up
    // as a short count.
    fn hammer<L: RawLock + Send + Sync + 'static>(lock: Arc<L>, counter: Arc<AtomicU64>) {
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = ScopedLock::new(&*lock);
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn mutex_excludes() {
        let counter = Arc::new(AtomicU64::new(0));
        hammer(Arc::new(Mutex::new()), Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn spin_lock_excludes() {
        let counter = Arc::new(AtomicU64::new(0));
        hammer(Arc::new(SpinLock::new()), Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn cas_lock_excludes() {
        let counter = Arc::new(AtomicU64::new(0));
        hammer(Arc::new(CasLock::new()), Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        let guard = ScopedLock::new(&lock);
        assert!(!lock.try_lock());
        drop(guard);
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn try_new_contended() {
        let lock = Mutex::new();
        let guard = ScopedLock::new(&lock);
        assert!(ScopedLock::try_new(&lock).is_none());
        drop(guard);
        assert!(ScopedLock::try_new(&lock).is_some());
    }

    #[test]
    fn null_lock_always_succeeds() {
        let lock = NullLock::new();
        assert!(lock.try_lock());
        assert!(lock.try_lock());
        let _guard = ScopedLock::new(&lock);
    }

    #[test]
    fn rw_lock_readers_share() {
        let lock = RwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
        assert!(lock.try_write().is_none());
        drop(a);
        drop(b);
        *lock.write() = 8;
        assert_eq!(*lock.read(), 8);
    }
}
