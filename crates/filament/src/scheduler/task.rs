//! Queue records for the scheduler.

use crate::fiber::Fiber;

/// What a queue record runs: a bare callback, materialized into a fiber by
/// the claiming worker, or an existing fiber. The two are mutually
/// exclusive by construction.
pub(crate) enum TaskPayload {
    Callback(Box<dyn FnOnce() + Send + 'static>),
    Fiber(Fiber),
}

/// One entry in the scheduler's run queue.
pub(crate) struct ScheduledTask {
    pub(crate) payload: TaskPayload,
    /// Worker index this task is pinned to; `None` means any worker.
    pub(crate) thread: Option<usize>,
}

impl ScheduledTask {
    pub(crate) fn from_callback(
        callback: Box<dyn FnOnce() + Send + 'static>,
        thread: Option<usize>,
    ) -> Self {
        Self {
            payload: TaskPayload::Callback(callback),
            thread,
        }
    }

    pub(crate) fn from_fiber(fiber: Fiber, thread: Option<usize>) -> Self {
        Self {
            payload: TaskPayload::Fiber(fiber),
            thread,
        }
    }
}

// SAFETY: `Fiber` is not `Send` because a resumed fiber's stack can hold
// thread-bound state. Fiber payloads enter this queue in exactly two ways:
// never resumed (no stack state exists yet), or re-enqueued pinned to the
// worker index that already ran them, in which case they are only ever
// handed back to that same thread. Callback payloads are `Send` by bound.
unsafe impl Send for ScheduledTask {}
