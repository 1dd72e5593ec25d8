//! Counting semaphore for OS threads.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// `wait` takes a permit, blocking the calling thread until one is
/// available; `notify` adds a permit and wakes one waiter. The crate uses it
/// for thread startup handshakes, and it doubles as a sequencing tool in
/// tests.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` initially available.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available. Returns `true` on success.
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Add a permit and wake one waiting thread.
    pub fn notify(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// The number of permits currently available.
    pub fn permits(&self) -> usize {
        *self.permits.lock()
    }
}
