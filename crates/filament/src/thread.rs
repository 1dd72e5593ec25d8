//! OS thread wrapper with a startup handshake.
//!
//! `Thread::spawn` does not return until the new thread has published its
//! kernel thread id and installed its name, so the caller can rely on both
//! immediately. Dropping an unjoined `Thread` detaches it.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use parking_lot::Mutex;

use crate::sync::Semaphore;

/// Errors from spawning or joining a [`Thread`].
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// The OS refused to create the thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),

    /// The thread terminated by panicking.
    #[error("thread {name} panicked")]
    Panicked {
        /// Name of the thread that panicked.
        name: String,
    },
}

thread_local! {
    static NAME_SLOT: RefCell<Option<Arc<Mutex<String>>>> = RefCell::new(None);
}

fn name_slot() -> Arc<Mutex<String>> {
    NAME_SLOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let fallback = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let created = Arc::new(Mutex::new(fallback));
        *slot = Some(Arc::clone(&created));
        created
    })
}

/// The kernel thread id of the calling thread.
///
/// On Linux this is the value `gettid` returns, which matches what tools
/// like `top -H` display. Elsewhere it is a stable hash of the std thread
/// id.
pub fn os_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::gettid() as u64 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }
}

/// A named OS thread.
///
/// The name is shared with the thread itself: [`Thread::set_current_name`]
/// called inside the thread is visible through [`Thread::name`] on the
/// wrapper.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: Arc<Mutex<String>>,
    os_id: u64,
}

impl Thread {
    /// Spawn a named thread running `callback`.
    ///
    /// Blocks until the new thread is up and has published its identity.
    /// On spawn failure no thread exists and no handle is returned.
    pub fn spawn<F>(callback: F, name: impl Into<String>) -> Result<Self, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let name = if name.is_empty() {
            "unnamed".to_string()
        } else {
            name
        };

        let shared_name = Arc::new(Mutex::new(name.clone()));
        let ready = Arc::new(Semaphore::new(0));
        let os_id = Arc::new(AtomicU64::new(0));

        let thread_name = Arc::clone(&shared_name);
        let thread_ready = Arc::clone(&ready);
        let thread_os_id = Arc::clone(&os_id);
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            NAME_SLOT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&thread_name)));
            thread_os_id.store(os_thread_id(), Ordering::Release);
            thread_ready.notify();
            callback();
        })?;

        // Identity is published before the callback starts.
        ready.wait();
        let os_id = os_id.load(Ordering::Acquire);
        debug!("thread {} started (tid {})", shared_name.lock(), os_id);

        Ok(Self {
            handle: Some(handle),
            name: shared_name,
            os_id,
        })
    }

    /// The thread's current name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// The thread's kernel id, recorded during the startup handshake.
    pub fn os_id(&self) -> u64 {
        self.os_id
    }

    /// Wait for the thread to finish.
    ///
    /// A panic inside the thread surfaces as [`ThreadError::Panicked`].
    pub fn join(mut self) -> Result<(), ThreadError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| ThreadError::Panicked { name: self.name() })
    }

    /// The name of the calling thread.
    pub fn current_name() -> String {
        name_slot().lock().clone()
    }

    /// Rename the calling thread. Empty names are ignored.
    ///
    /// For threads created through [`Thread::spawn`] the new name is also
    /// visible on the wrapper object.
    pub fn set_current_name(name: impl Into<String>) {
        let name = name.into();
        if name.is_empty() {
            return;
        }
        *name_slot().lock() = name;
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            debug!("thread {} detached", self.name());
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name())
            .field("os_id", &self.os_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn handshake_publishes_identity() {
        let thread = Thread::spawn(
            || {
                assert_eq!(Thread::current_name(), "handshake");
            },
            "handshake",
        )
        .unwrap();
        assert_eq!(thread.name(), "handshake");
        assert_ne!(thread.os_id(), 0);
        thread.join().unwrap();
    }

    #[test]
    fn counter_under_mutex_across_threads() {
        let counter = Arc::new(Mutex::new(0u64));
        let mut threads = Vec::new();
        for i in 0..5 {
            let counter = Arc::clone(&counter);
            threads.push(
                Thread::spawn(
                    move || {
                        for _ in 0..10_000 {
                            *counter.lock() += 1;
                        }
                    },
                    format!("count-{i}"),
                )
                .unwrap(),
            );
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*counter.lock(), 50_000);
    }

    #[test]
    fn rename_is_visible_on_the_wrapper() {
        let renamed = Arc::new(Semaphore::new(0));
        let proceed = Arc::new(Semaphore::new(0));
        let renamed_tx = Arc::clone(&renamed);
        let proceed_rx = Arc::clone(&proceed);
        let thread = Thread::spawn(
            move || {
                Thread::set_current_name("after");
                renamed_tx.notify();
                proceed_rx.wait();
            },
            "before",
        )
        .unwrap();
        renamed.wait();
        assert_eq!(thread.name(), "after");
        proceed.notify();
        thread.join().unwrap();
    }

    #[test]
    fn join_reports_panics() {
        let thread = Thread::spawn(|| panic!("boom"), "panicker").unwrap();
        match thread.join() {
            Err(ThreadError::Panicked { name }) => assert_eq!(name, "panicker"),
            other => panic!("expected panic report, got {other:?}"),
        }
    }

    #[test]
    fn drop_detaches() {
        let finished = Arc::new(Semaphore::new(0));
        let finished_tx = Arc::clone(&finished);
        let thread = Thread::spawn(
            move || {
                std::thread::sleep(Duration::from_millis(10));
                finished_tx.notify();
            },
            "detached",
        )
        .unwrap();
        drop(thread);
        finished.wait();
    }
}
