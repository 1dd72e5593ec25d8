//! Stackful fibers.
//!
//! A fiber is a cooperatively scheduled unit of execution with its own
//! stack. Every thread that touches fibers has an implicit main fiber (id
//! 0, no separate stack) representing the thread's original context; task
//! fibers always switch in from and back out to the main fiber. There is no
//! fiber-to-fiber switching.
//!
//! A task fiber moves through `Init -> Exec` on first resume, suspends to
//! `Ready` or `Hold` via [`yield_ready`]/[`yield_hold`], and ends in `Term`
//! (normal return) or `Except` (panic, contained by the trampoline).

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use log::{debug, error, warn};
use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

static STACK_SIZE: Lazy<Arc<ConfigVar<usize>>> = Lazy::new(|| {
    Config::lookup(
        "fiber.stack_size",
        DEFAULT_STACK_SIZE,
        "stack size in bytes for task fibers",
    )
    .unwrap_or_else(|err| {
        error!("fiber.stack_size registration failed: {err}");
        Arc::new(ConfigVar::new(
            "fiber.stack_size",
            DEFAULT_STACK_SIZE,
            "stack size in bytes for task fibers",
        ))
    })
});

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

type FiberCoroutine = Coroutine<(), (), ()>;

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, never resumed.
    Init = 0,
    /// Currently executing on some thread.
    Exec = 1,
    /// Suspended; will not be rescheduled automatically.
    Hold = 2,
    /// Suspended; eligible for rescheduling.
    Ready = 3,
    /// The callback returned normally.
    Term = 4,
    /// The callback panicked.
    Except = 5,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberState::Init,
            1 => FiberState::Exec,
            2 => FiberState::Hold,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

/// Errors from fiber lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    /// The fiber is already executing.
    #[error("fiber {id} is already running")]
    AlreadyRunning {
        /// Id of the fiber.
        id: u64,
    },

    /// The fiber has finished and cannot be resumed without a reset.
    #[error("fiber {id} cannot be resumed from state {state:?}")]
    NotResumable {
        /// Id of the fiber.
        id: u64,
        /// State the fiber was in.
        state: FiberState,
    },

    /// Resume was attempted from inside another fiber.
    #[error("fiber {id} cannot be resumed from inside another fiber")]
    NestedResume {
        /// Id of the fiber.
        id: u64,
    },

    /// Reset was attempted while the fiber could still run.
    #[error("fiber {id} cannot be reset from state {state:?}")]
    ResetDenied {
        /// Id of the fiber.
        id: u64,
        /// State the fiber was in.
        state: FiberState,
    },
}

/// Bookkeeping shared between a `Fiber`, its trampoline, and observers.
struct FiberShared {
    id: u64,
    state: AtomicU8,
    yielder: AtomicPtr<Yielder<(), ()>>,
    force_unwinding: AtomicBool,
}

impl FiberShared {
    fn new(id: u64, state: FiberState) -> Arc<Self> {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            state: AtomicU8::new(state as u8),
            yielder: AtomicPtr::new(ptr::null_mut()),
            force_unwinding: AtomicBool::new(false),
        })
    }

    fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for FiberShared {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<FiberShared>>> = RefCell::new(None);
    static MAIN: RefCell<Option<Arc<FiberShared>>> = RefCell::new(None);
    static ACTIVE_YIELDER: Cell<*const Yielder<(), ()>> = Cell::new(ptr::null());
}

fn main_fiber_shared() -> Arc<FiberShared> {
    MAIN.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(main) = slot.as_ref() {
            return Arc::clone(main);
        }
        let main = FiberShared::new(0, FiberState::Exec);
        *slot = Some(Arc::clone(&main));
        main
    })
}

/// Observer handle to a fiber's identity and state.
///
/// Cheap to clone and safe to hold after the fiber finishes; it never keeps
/// the fiber's stack alive.
#[derive(Clone)]
pub struct FiberRef {
    shared: Arc<FiberShared>,
}

impl FiberRef {
    /// The fiber's id. Main fibers are id 0.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The fiber's current state.
    pub fn state(&self) -> FiberState {
        self.shared.state()
    }

    /// Whether this is a thread's main fiber.
    pub fn is_main(&self) -> bool {
        self.shared.id == 0
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// The fiber currently executing on this thread.
///
/// Inside a task fiber this is that fiber; otherwise it is the thread's
/// main fiber, which is created on first use.
pub fn current() -> FiberRef {
    let current = CURRENT.with(|slot| slot.borrow().clone());
    match current {
        Some(shared) => FiberRef { shared },
        None => FiberRef {
            shared: main_fiber_shared(),
        },
    }
}

/// This thread's main fiber, created on first use.
pub fn main_fiber() -> FiberRef {
    FiberRef {
        shared: main_fiber_shared(),
    }
}

/// Id of the fiber currently executing on this thread; 0 outside task
/// fibers.
pub fn current_fiber_id() -> u64 {
    CURRENT.with(|slot| slot.borrow().as_ref().map_or(0, |shared| shared.id))
}

/// Number of live fibers in the process, main fiber records included.
pub fn total_fibers() -> u64 {
    TOTAL_FIBERS.load(Ordering::Relaxed)
}

/// Suspend the current task fiber and mark it `Ready`.
///
/// Control returns to the main fiber. Calling this outside a task fiber is
/// a protocol violation; it is logged and ignored.
pub fn yield_ready() {
    suspend_current(FiberState::Ready);
}

/// Suspend the current task fiber and mark it `Hold`.
///
/// Control returns to the main fiber. Calling this outside a task fiber is
/// a protocol violation; it is logged and ignored.
pub fn yield_hold() {
    suspend_current(FiberState::Hold);
}

fn suspend_current(state: FiberState) {
    let Some(shared) = CURRENT.with(|slot| slot.borrow().clone()) else {
        warn!("yield requested outside of a task fiber; ignoring");
        debug_assert!(false, "yield outside of a task fiber");
        return;
    };
    let yielder = ACTIVE_YIELDER.with(|slot| slot.get());
    debug_assert!(!yielder.is_null());
    if yielder.is_null() {
        return;
    }
    shared.set_state(state);
    // Valid for the lifetime of the coroutine body we are inside of.
    unsafe { (*yielder).suspend(()) };
}

/// A stackful task fiber.
///
/// Owns the coroutine and its stack. Not `Send`: once resumed, the stack
/// may hold thread-bound state, so a fiber stays with the thread that first
/// ran it.
pub struct Fiber {
    shared: Arc<FiberShared>,
    coroutine: Option<FiberCoroutine>,
    stack_size: usize,
}

impl Fiber {
    /// Create a fiber running `callback`, with the stack size taken from
    /// the `fiber.stack_size` configuration variable.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(callback, STACK_SIZE.get())
    }

    /// Create a fiber running `callback` with an explicit stack size.
    pub fn with_stack_size<F>(callback: F, stack_size: usize) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        // Make sure this thread's main fiber exists before any task fiber.
        main_fiber_shared();
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let shared = FiberShared::new(id, FiberState::Init);
        let coroutine = build_coroutine(Arc::clone(&shared), Box::new(callback), stack_size);
        debug!("fiber {id} created ({stack_size} byte stack)");
        Self {
            shared,
            coroutine: Some(coroutine),
            stack_size,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The fiber's current state.
    pub fn state(&self) -> FiberState {
        self.shared.state()
    }

    /// The fiber's stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// An observer handle to this fiber.
    pub fn observer(&self) -> FiberRef {
        FiberRef {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Switch from the main fiber into this fiber.
    ///
    /// Returns once the fiber suspends or finishes. The caller must be the
    /// thread's main context; resuming from inside another fiber is
    /// rejected.
    pub fn swap_in(&mut self) -> Result<(), FiberError> {
        match self.state() {
            FiberState::Exec => {
                return Err(FiberError::AlreadyRunning { id: self.shared.id });
            }
            FiberState::Term | FiberState::Except => {
                return Err(FiberError::NotResumable {
                    id: self.shared.id,
                    state: self.state(),
                });
            }
            FiberState::Init | FiberState::Ready | FiberState::Hold => {}
        }
        if CURRENT.with(|slot| slot.borrow().is_some()) {
            return Err(FiberError::NestedResume { id: self.shared.id });
        }
        main_fiber_shared();

        let coroutine = self.coroutine.as_mut().ok_or(FiberError::NotResumable {
            id: self.shared.id,
            state: FiberState::Term,
        })?;

        CURRENT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&self.shared)));
        let yielder = self.shared.yielder.load(Ordering::Acquire);
        if !yielder.is_null() {
            // Re-resume: the trampoline only installs the yielder once.
            ACTIVE_YIELDER.with(|slot| slot.set(yielder));
        }
        self.shared.set_state(FiberState::Exec);

        let result = coroutine.resume(());

        CURRENT.with(|slot| *slot.borrow_mut() = None);
        ACTIVE_YIELDER.with(|slot| slot.set(ptr::null()));

        if let CoroutineResult::Return(()) = result {
            debug_assert!(matches!(
                self.state(),
                FiberState::Term | FiberState::Except
            ));
        }
        Ok(())
    }

    /// Rebuild the fiber around a new callback, reusing its id and stack
    /// size.
    ///
    /// Only legal before the first resume or after the fiber finished.
    pub fn reset<F>(&mut self, callback: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.state() {
            FiberState::Init | FiberState::Term | FiberState::Except => {}
            state => {
                return Err(FiberError::ResetDenied {
                    id: self.shared.id,
                    state,
                });
            }
        }
        self.shared.yielder.store(ptr::null_mut(), Ordering::Release);
        self.shared.force_unwinding.store(false, Ordering::Release);
        let coroutine = build_coroutine(
            Arc::clone(&self.shared),
            Box::new(callback),
            self.stack_size,
        );
        self.coroutine = Some(coroutine);
        self.shared.set_state(FiberState::Init);
        debug!("fiber {} reset", self.shared.id);
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        match self.state() {
            FiberState::Ready | FiberState::Hold => {
                warn!(
                    "fiber {} dropped while suspended in state {:?}; unwinding its stack",
                    self.shared.id,
                    self.state()
                );
                self.shared.force_unwinding.store(true, Ordering::Release);
            }
            FiberState::Exec => {
                debug_assert!(false, "fiber dropped while executing");
            }
            FiberState::Init | FiberState::Term | FiberState::Except => {}
        }
        // The coroutine field drops next; a suspended one unwinds its
        // stack, running destructors of everything the callback holds.
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

fn allocate_stack(stack_size: usize) -> DefaultStack {
    match DefaultStack::new(stack_size) {
        Ok(stack) => stack,
        Err(err) => {
            error!(
                "fiber stack allocation of {stack_size} bytes failed: {err}\n{}",
                Backtrace::force_capture()
            );
            process::abort();
        }
    }
}

fn build_coroutine(
    shared: Arc<FiberShared>,
    callback: Box<dyn FnOnce() + Send>,
    stack_size: usize,
) -> FiberCoroutine {
    let stack = allocate_stack(stack_size);
    Coroutine::with_stack(stack, move |yielder, ()| {
        shared.yielder.store(
            yielder as *const Yielder<(), ()> as *mut Yielder<(), ()>,
            Ordering::Release,
        );
        ACTIVE_YIELDER.with(|slot| slot.set(yielder as *const Yielder<(), ()>));

        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => shared.set_state(FiberState::Term),
            Err(payload) => {
                if shared.force_unwinding.load(Ordering::Acquire) {
                    // Stack teardown in progress; let it finish.
                    panic::resume_unwind(payload);
                }
                shared.set_state(FiberState::Except);
                error!("fiber {} failed: {}", shared.id, panic_message(&*payload));
            }
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
