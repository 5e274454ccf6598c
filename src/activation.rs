//! Per-invocation execution state.
//!
//! One registered identity can be entered several times concurrently, up to
//! [`MAX_RECUR_DEPTH`](crate::MAX_RECUR_DEPTH). Each entry is an
//! [`Activation`]: the owned stack-switch context plus the state word the
//! dispatcher drives and the flags and hooks the running body manipulates.
//! The struct is shared through an `Arc` between the dispatcher (driving
//! thread) and the body (its own context), so every field is either atomic
//! or behind a short-lived `spin::Mutex` that is never held across a context
//! switch.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::any::Any;

use portable_atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

use crate::context::StackContext;
use crate::registry::Tid;
use crate::vm::VmPort;

/// Maximum number of completion handlers one activation may register.
pub const MAX_POST_HOOKS: usize = 5;

/// Maximum depth of the per-activation user-data stack.
pub const MAX_UDATA: usize = 5;

/// Execution state of one activation, driven by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Slot is unallocated; only observable after completion
    None = 0,
    /// Created, body has not run yet
    Starting = 1,
    /// Body is runnable
    Running = 2,
    /// Parked until an explicit wake
    Sleeping = 3,
    /// Woken, will resume on the next dispatch
    Awaken = 4,
    /// Detach from the guest control flow on the next dispatch
    Detach = 5,
    /// Detach and destroy on the next dispatch
    Delete = 6,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RunState::None,
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Sleeping,
            4 => RunState::Awaken,
            5 => RunState::Detach,
            6 => RunState::Delete,
            _ => panic!("invalid run state {}", raw),
        }
    }
}

/// Reason a context reported when it last switched back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchReason {
    /// Voluntary yield from a detached body
    Yield = 0,
    /// Attached body waits for the dispatcher to make progress
    Wait = 1,
    /// Park until an explicit wake
    Sleep = 2,
    /// Transfer control to other guest code without suspending
    Sched = 3,
    /// Entry function finished
    Done = 4,
    /// Body asked to attach to the guest control flow
    Attach = 5,
    /// Body asked to detach from the guest control flow
    Detach = 6,
}

impl SwitchReason {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SwitchReason::Yield,
            1 => SwitchReason::Wait,
            2 => SwitchReason::Sleep,
            3 => SwitchReason::Sched,
            4 => SwitchReason::Done,
            5 => SwitchReason::Attach,
            6 => SwitchReason::Detach,
            _ => panic!("invalid switch reason {}", raw),
        }
    }
}

/// Non-local exit of a thread body.
///
/// A tagged error value that bodies propagate with `?`, standing in for a
/// long jump out of the body. A body that swallows it cannot be cancelled,
/// which the cancel path treats as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// A pending cancellation was observed at a cancellation point
    Cancelled,
    /// The body called [`Coop::exit`](crate::Coop::exit)
    Exited,
}

/// Result type thread bodies return.
pub type BodyResult = Result<(), Unwind>;

/// How an activation's entry function finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Completion {
    /// Entry has not returned yet
    Pending = 0,
    /// Body returned `Ok(())`; completion handlers fire
    Normal = 1,
    /// Body unwound through cancellation; cleanup handler fired instead
    Cancelled = 2,
    /// Body exited explicitly; no handlers fire
    Exited = 3,
}

impl Completion {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Completion::Pending,
            1 => Completion::Normal,
            2 => Completion::Cancelled,
            3 => Completion::Exited,
            _ => panic!("invalid completion kind {}", raw),
        }
    }
}

/// Single-use callback attached to one activation.
pub type ActivationHook = Box<dyn FnOnce() + Send>;

/// Opaque caller-supplied value on the user-data stack.
pub type UserData = Box<dyn Any + Send>;

/// One concurrent invocation of a registered thread identity.
pub(crate) struct Activation<C: StackContext, V: VmPort> {
    tid: Tid,
    context: Mutex<Option<C>>,
    state: AtomicU8,
    /// Sleep requested asynchronously, honored at the next dispatch.
    set_sleep: AtomicBool,
    /// Guest control flow is currently diverted into this activation.
    attached: AtomicBool,
    /// A leave request was issued; later cancellation requests are ignored.
    leaving: AtomicBool,
    cancelled: AtomicBool,
    reason: AtomicU8,
    completion: AtomicU8,
    saved_return: Mutex<Option<V::Location>>,
    post_hooks: Mutex<Vec<ActivationHook>>,
    sleep_hook: Mutex<Option<ActivationHook>>,
    cleanup_hook: Mutex<Option<ActivationHook>>,
    udata: Mutex<Vec<UserData>>,
}

impl<C: StackContext, V: VmPort> Activation<C, V> {
    pub(crate) fn new(tid: Tid, init_sleep: bool) -> Self {
        Self {
            tid,
            context: Mutex::new(None),
            state: AtomicU8::new(RunState::None as u8),
            set_sleep: AtomicBool::new(init_sleep),
            attached: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            reason: AtomicU8::new(SwitchReason::Sched as u8),
            completion: AtomicU8::new(Completion::Pending as u8),
            saved_return: Mutex::new(None),
            post_hooks: Mutex::new(Vec::new()),
            sleep_hook: Mutex::new(None),
            cleanup_hook: Mutex::new(None),
            udata: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn tid(&self) -> Tid {
        self.tid
    }

    pub(crate) fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Honor and clear a pending asynchronous sleep request.
    pub(crate) fn take_set_sleep(&self) -> bool {
        self.set_sleep.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn request_sleep(&self) {
        self.set_sleep.store(true, Ordering::Release);
    }

    pub(crate) fn attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::Acquire)
    }

    pub(crate) fn set_leaving(&self) {
        self.leaving.store(true, Ordering::Release);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the activation cancelled. Irrevocable.
    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn reason(&self) -> SwitchReason {
        SwitchReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_reason(&self, reason: SwitchReason) {
        self.reason.store(reason as u8, Ordering::Release);
    }

    pub(crate) fn completion(&self) -> Completion {
        Completion::from_u8(self.completion.load(Ordering::Acquire))
    }

    pub(crate) fn set_completion(&self, completion: Completion) {
        self.completion.store(completion as u8, Ordering::Release);
    }

    pub(crate) fn put_context(&self, context: C) {
        *self.context.lock() = Some(context);
    }

    pub(crate) fn take_context(&self) -> Option<C> {
        self.context.lock().take()
    }

    /// Resume the context and run it until its next suspension point.
    ///
    /// The context lock is held for the whole slice; the body side never
    /// touches it, so this cannot deadlock even for nested invocations.
    pub(crate) fn call_context(&self) {
        let guard = self.context.lock();
        let context = guard.as_ref().expect("activation has no context");
        context.call();
    }

    pub(crate) fn save_return(&self, loc: V::Location) {
        *self.saved_return.lock() = Some(loc);
    }

    pub(crate) fn take_return(&self) -> Option<V::Location> {
        self.saved_return.lock().take()
    }

    pub(crate) fn push_post_hook(&self, hook: ActivationHook) {
        let mut hooks = self.post_hooks.lock();
        assert!(hooks.len() < MAX_POST_HOOKS, "completion handler overflow");
        hooks.push(hook);
    }

    /// Drain completion handlers in registration order.
    pub(crate) fn take_post_hooks(&self) -> Vec<ActivationHook> {
        core::mem::take(&mut *self.post_hooks.lock())
    }

    pub(crate) fn set_sleep_hook(&self, hook: ActivationHook) {
        *self.sleep_hook.lock() = Some(hook);
    }

    pub(crate) fn take_sleep_hook(&self) -> Option<ActivationHook> {
        self.sleep_hook.lock().take()
    }

    pub(crate) fn set_cleanup_hook(&self, hook: ActivationHook) {
        *self.cleanup_hook.lock() = Some(hook);
    }

    pub(crate) fn take_cleanup_hook(&self) -> Option<ActivationHook> {
        self.cleanup_hook.lock().take()
    }

    pub(crate) fn push_udata(&self, value: UserData) {
        let mut udata = self.udata.lock();
        assert!(udata.len() < MAX_UDATA, "user data stack overflow");
        udata.push(value);
    }

    pub(crate) fn pop_udata(&self) -> UserData {
        self.udata.lock().pop().expect("user data stack empty")
    }
}
