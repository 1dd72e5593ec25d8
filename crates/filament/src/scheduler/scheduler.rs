//! Scheduler lifecycle and the worker dispatch loop.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use super::task::{ScheduledTask, TaskPayload};
use crate::fiber::{self, Fiber, FiberState};
use crate::thread::{os_thread_id, Thread};

/// Upper bound on how long an idle worker sleeps between queue checks.
/// A tickle wakes it earlier; the timeout covers a missed wakeup.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Errors from scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Only never-resumed fibers may be handed to the scheduler; the
    /// rejected fiber is dropped.
    #[error("fiber {id} cannot be scheduled from state {state:?}")]
    FiberNotStartable {
        /// Id of the rejected fiber.
        id: u64,
        /// State the fiber was in.
        state: FiberState,
    },
}

struct SchedulerShared {
    name: String,
    worker_count: usize,
    queue: Mutex<VecDeque<ScheduledTask>>,
    idle: Condvar,
    stopping: AtomicBool,
}

impl SchedulerShared {
    fn push(&self, task: ScheduledTask) {
        if self.stopping.load(Ordering::Acquire) {
            warn!(
                "scheduler {}: task scheduled after stop; dropping it",
                self.name
            );
            return;
        }
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Wake idle workers. Issued after the queue lock is released.
    fn tickle(&self) {
        self.idle.notify_all();
    }

    /// Re-enqueue a fiber that yielded `Ready`, pinned to the worker that
    /// ran it. Bypasses the stopping check: an in-flight fiber keeps its
    /// turn during shutdown drain.
    fn requeue(&self, fiber: Fiber, worker: usize) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(ScheduledTask::from_fiber(fiber, Some(worker)));
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    fn clamp_affinity(&self, worker: usize) -> Option<usize> {
        if worker >= self.worker_count {
            warn!(
                "scheduler {}: affinity {} is out of range ({} workers); scheduling anywhere",
                self.name, worker, self.worker_count
            );
            return None;
        }
        Some(worker)
    }
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<SchedulerHandle>> = RefCell::new(None);
}

/// Cloneable submission handle to a [`Scheduler`].
///
/// Valid from any thread, including from inside tasks the scheduler runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// The scheduler's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submit a callback to run on any worker.
    pub fn schedule<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .push(ScheduledTask::from_callback(Box::new(callback), None));
    }

    /// Submit a callback pinned to the worker at `worker` index.
    ///
    /// An out-of-range index is logged and treated as unpinned.
    pub fn schedule_to<F>(&self, callback: F, worker: usize)
    where
        F: FnOnce() + Send + 'static,
    {
        let affinity = self.shared.clamp_affinity(worker);
        self.shared
            .push(ScheduledTask::from_callback(Box::new(callback), affinity));
    }

    /// Submit a fiber. Only fibers that have never been resumed are
    /// accepted; anything else is rejected and dropped.
    pub fn schedule_fiber(&self, fiber: Fiber) -> Result<(), SchedulerError> {
        if fiber.state() != FiberState::Init {
            return Err(SchedulerError::FiberNotStartable {
                id: fiber.id(),
                state: fiber.state(),
            });
        }
        self.shared.push(ScheduledTask::from_fiber(fiber, None));
        Ok(())
    }

    /// Submit a batch of callbacks with a single wakeup decision.
    pub fn schedule_batch<I>(&self, callbacks: I)
    where
        I: IntoIterator,
        I::Item: FnOnce() + Send + 'static,
    {
        if self.shared.stopping.load(Ordering::Acquire) {
            warn!(
                "scheduler {}: batch scheduled after stop; dropping it",
                self.shared.name
            );
            return;
        }
        let was_empty = {
            let mut queue = self.shared.queue.lock();
            let was_empty = queue.is_empty();
            for callback in callbacks {
                queue.push_back(ScheduledTask::from_callback(Box::new(callback), None));
            }
            was_empty && !queue.is_empty()
        };
        if was_empty {
            self.shared.tickle();
        }
    }
}

/// An N:M scheduler: distributes tasks over `worker_count` threads.
///
/// With `use_caller` the thread that calls [`Scheduler::start`] counts as
/// worker 0 and runs the dispatch loop inside [`Scheduler::stop`], so a
/// scheduler over a single caller thread needs no extra threads at all.
///
/// Dropping the scheduler stops it.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Vec<Thread>,
    worker_ids: Vec<u64>,
    use_caller: bool,
    started: bool,
    stopped: bool,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers (0 means one per CPU
    /// core). No threads are spawned until [`Scheduler::start`].
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Self {
        let worker_count = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        let shared = Arc::new(SchedulerShared {
            name: name.into(),
            worker_count,
            queue: Mutex::new(VecDeque::new()),
            idle: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        Self {
            shared,
            workers: Vec::new(),
            worker_ids: Vec::new(),
            use_caller,
            started: false,
            stopped: false,
        }
    }

    /// The scheduler submitting work for the calling thread, if the thread
    /// belongs to one.
    pub fn current() -> Option<SchedulerHandle> {
        CURRENT_SCHEDULER.with(|slot| slot.borrow().clone())
    }

    /// The scheduler's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of workers, the caller included when `use_caller` is set.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// A cloneable submission handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// OS thread ids of the workers, aligned with worker indices.
    /// Populated by [`Scheduler::start`].
    pub fn worker_thread_ids(&self) -> &[u64] {
        &self.worker_ids
    }

    /// Submit a callback to run on any worker.
    pub fn schedule<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().schedule(callback);
    }

    /// Submit a callback pinned to a worker index.
    pub fn schedule_to<F>(&self, callback: F, worker: usize)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().schedule_to(callback, worker);
    }

    /// Submit a never-resumed fiber.
    pub fn schedule_fiber(&self, fiber: Fiber) -> Result<(), SchedulerError> {
        self.handle().schedule_fiber(fiber)
    }

    /// Submit a batch of callbacks with a single wakeup decision.
    pub fn schedule_batch<I>(&self, callbacks: I)
    where
        I: IntoIterator,
        I::Item: FnOnce() + Send + 'static,
    {
        self.handle().schedule_batch(callbacks);
    }

    /// Spawn the worker threads. Returns once every worker has completed
    /// its startup handshake. Idempotent.
    ///
    /// Thread creation failure is unrecoverable and aborts the process.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let first = if self.use_caller {
            // The caller is worker 0; make the scheduler reachable from
            // its thread for the lifetime of the pool.
            CURRENT_SCHEDULER.with(|slot| {
                *slot.borrow_mut() = Some(self.handle());
            });
            self.worker_ids.push(os_thread_id());
            1
        } else {
            0
        };
        for index in first..self.shared.worker_count {
            let shared = Arc::clone(&self.shared);
            let thread_name = format!("{}-worker-{}", self.shared.name, index);
            match Thread::spawn(move || run_worker(shared, index), thread_name.clone()) {
                Ok(thread) => {
                    self.worker_ids.push(thread.os_id());
                    self.workers.push(thread);
                }
                Err(err) => {
                    error!(
                        "scheduler {}: failed to spawn {}: {}\n{}",
                        self.shared.name,
                        thread_name,
                        err,
                        Backtrace::force_capture()
                    );
                    process::abort();
                }
            }
        }
        debug!(
            "scheduler {} started with {} workers",
            self.shared.name, self.shared.worker_count
        );
    }

    /// Stop the scheduler: drain the queue, then join every worker.
    /// Idempotent.
    ///
    /// With `use_caller` the calling thread runs the dispatch loop as
    /// worker 0 until its share of the queue drains; this is the only
    /// point where caller-pinned tasks execute.
    pub fn stop(&mut self) {
        if !self.started || self.stopped {
            return;
        }
        self.stopped = true;

        self.shared.stopping.store(true, Ordering::Release);
        self.shared.tickle();

        if self.use_caller {
            run_worker(Arc::clone(&self.shared), 0);
            // run_worker clears the slot on exit; this covers the path
            // where the drain is ever skipped.
            CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = None);
        }

        for worker in self.workers.drain(..) {
            let name = worker.name();
            if let Err(err) = worker.join() {
                error!("scheduler {}: worker {} failed: {}", self.shared.name, name, err);
            }
        }

        let mut queue = self.shared.queue.lock();
        if !queue.is_empty() {
            warn!(
                "scheduler {}: dropping {} unclaimed tasks at shutdown",
                self.shared.name,
                queue.len()
            );
            queue.clear();
        }
        debug!("scheduler {} stopped", self.shared.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Dispatch loop
// ============================================================================

fn run_worker(shared: Arc<SchedulerShared>, index: usize) {
    trace!(
        "scheduler {}: worker {} running on thread {}",
        shared.name,
        index,
        os_thread_id()
    );
    // This thread's scheduling context is its main fiber.
    fiber::main_fiber();
    CURRENT_SCHEDULER.with(|slot| {
        *slot.borrow_mut() = Some(SchedulerHandle {
            shared: Arc::clone(&shared),
        });
    });

    loop {
        let task = {
            let mut queue = shared.queue.lock();
            match claim(&mut queue, index) {
                Some(task) => Some(task),
                None => {
                    if shared.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    let _ = shared.idle.wait_for(&mut queue, IDLE_WAIT);
                    claim(&mut queue, index)
                }
            }
        };
        let Some(task) = task else {
            continue;
        };
        match task.payload {
            TaskPayload::Callback(callback) => run_fiber(&shared, index, Fiber::new(callback)),
            TaskPayload::Fiber(fiber) => run_fiber(&shared, index, fiber),
        }
    }

    CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = None);
    trace!("scheduler {}: worker {} exiting", shared.name, index);
}

/// Take the first task this worker may run: unpinned, or pinned to its
/// index. FIFO within that filter.
fn claim(queue: &mut VecDeque<ScheduledTask>, index: usize) -> Option<ScheduledTask> {
    let position = queue
        .iter()
        .position(|task| task.thread.map_or(true, |pinned| pinned == index))?;
    queue.remove(position)
}

fn run_fiber(shared: &Arc<SchedulerShared>, index: usize, mut fiber: Fiber) {
    let id = fiber.id();
    if let Err(err) = fiber.swap_in() {
        error!(
            "scheduler {}: worker {} could not resume fiber {}: {}",
            shared.name, index, id, err
        );
        return;
    }
    match fiber.state() {
        FiberState::Ready => {
            // A started fiber never migrates; it stays with this worker.
            shared.requeue(fiber, index);
        }
        FiberState::Hold => {
            debug!(
                "scheduler {}: worker {} releasing held fiber {}",
                shared.name, index, id
            );
        }
        FiberState::Term | FiberState::Except => {}
        state => {
            debug_assert!(false, "fiber {id} left swap_in in state {state:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Instant;

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn callbacks_run_on_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(2, false, "basic");
        scheduler.start();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            scheduler.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_until("callbacks", || counter.load(Ordering::SeqCst) == 8);
        scheduler.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn tasks_scheduled_before_start_run_after_start() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(1, false, "prestart");
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            scheduler.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.start();
        wait_until("prestart tasks", || counter.load(Ordering::SeqCst) == 3);
        scheduler.stop();
    }

    #[test]
    fn batch_runs_every_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(2, false, "batch");
        scheduler.start();
        let callbacks: Vec<_> = (0..10)
            .map(|_| {
                let counter = Arc::clone(&counter);
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .collect();
        scheduler.schedule_batch(callbacks);
        wait_until("batch", || counter.load(Ordering::SeqCst) == 10);
        scheduler.stop();
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut scheduler = Scheduler::new(1, false, "idempotent");
        scheduler.start();
        scheduler.start();
        scheduler.stop();
        scheduler.stop();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut scheduler = Scheduler::new(1, false, "never-started");
        scheduler.stop();
    }

    #[test]
    fn schedule_after_stop_is_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(1, false, "late");
        scheduler.start();
        scheduler.stop();
        let late = Arc::clone(&counter);
        scheduler.schedule(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn started_fiber_is_rejected() {
        let mut fiber = Fiber::new(|| fiber::yield_hold());
        fiber.swap_in().unwrap();
        let mut scheduler = Scheduler::new(1, false, "reject");
        scheduler.start();
        let id = fiber.id();
        assert_eq!(
            scheduler.schedule_fiber(fiber),
            Err(SchedulerError::FiberNotStartable {
                id,
                state: FiberState::Hold
            })
        );
        scheduler.stop();
    }

    #[test]
    fn out_of_range_affinity_still_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(1, false, "clamp");
        scheduler.start();
        let inner = Arc::clone(&counter);
        scheduler.schedule_to(
            move || {
                inner.fetch_add(1, Ordering::SeqCst);
            },
            7,
        );
        wait_until("clamped task", || counter.load(Ordering::SeqCst) == 1);
        scheduler.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(1, false, "contain");
        scheduler.start();
        scheduler.schedule(|| panic!("task failure"));
        let inner = Arc::clone(&counter);
        scheduler.schedule(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        wait_until("survivor task", || counter.load(Ordering::SeqCst) == 1);
        scheduler.stop();
    }

    #[test]
    fn caller_handle_is_scoped_to_the_pool_lifetime() {
        let mut scheduler = Scheduler::new(1, true, "caller-scope");
        // Construction alone must not leak a handle into this thread.
        assert!(Scheduler::current().is_none());
        scheduler.start();
        assert_eq!(
            Scheduler::current().map(|handle| handle.name().to_string()),
            Some("caller-scope".to_string())
        );
        scheduler.stop();
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn unstarted_caller_scheduler_leaves_no_handle_behind() {
        {
            let _scheduler = Scheduler::new(1, true, "never-started-caller");
            assert!(Scheduler::current().is_none());
        }
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn current_is_set_inside_tasks() {
        let observed = Arc::new(Mutex::new(None));
        let mut scheduler = Scheduler::new(1, false, "introspect");
        scheduler.start();
        let inner = Arc::clone(&observed);
        scheduler.schedule(move || {
            *inner.lock() = Scheduler::current().map(|handle| handle.name().to_string());
        });
        wait_until("introspection", || observed.lock().is_some());
        scheduler.stop();
        assert_eq!(observed.lock().as_deref(), Some("introspect"));
        assert!(Scheduler::current().is_none());
    }
}
