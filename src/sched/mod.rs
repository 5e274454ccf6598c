//! Cooperative scheduler core.
//!
//! [`CoopScheduler`] owns the identity registry, the active-identity
//! work-list and the global counters, and exposes the whole producer-facing
//! lifecycle: register, start, wake, cancel, join, flush, shutdown. The
//! state-machine dispatcher that reacts to guest trap hits lives in
//! [`dispatch`]; the two are one type split across the two files.
//!
//! The scheduler is a cheap `Arc` handle: clone it freely, park a clone in a
//! `static`, or hand clones to thread bodies through
//! [`Coop::scheduler`](crate::Coop::scheduler). All mutation happens on the
//! single driving thread; internal locks only bridge the scheduler and the
//! suspended context stacks and are never held across a switch.

mod dispatch;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::activation::{Activation, BodyResult, RunState};
use crate::context::{ContextEntry, StackContext};
use crate::coop::{run_body, Coop};
use crate::errors::RegisterError;
use crate::registry::{IdentityHook, Registry, Tid};
use crate::vm::VmPort;

/// Maximum number of identities with at least one live activation.
pub const MAX_ACTIVE: usize = 10;

/// Maximum concurrent activations of one identity.
pub const MAX_RECUR_DEPTH: usize = 5;

/// Stack size for each activation's context.
pub const STACK_SIZE: usize = 128 * 1024;

pub(crate) struct Inner<C: StackContext, V: VmPort> {
    pub(crate) vm: V,
    pub(crate) registry: Registry<C, V>,
    /// Dense list of identities with live activations.
    pub(crate) active: Mutex<Vec<Tid>>,
    /// Stack of identities whose bodies are currently executing.
    pub(crate) current: Mutex<Vec<Tid>>,
    /// Dispatcher re-entrancy count.
    pub(crate) running: AtomicUsize,
    /// Re-entrancy count of attached activations only.
    pub(crate) joinable_running: AtomicUsize,
    /// Live attached activations.
    pub(crate) joinable: AtomicUsize,
    /// All live activations.
    pub(crate) total: AtomicUsize,
    pub(crate) nested_warned: AtomicBool,
}

/// Cooperative thread scheduler for a single-threaded virtual machine host.
pub struct CoopScheduler<C: StackContext, V: VmPort> {
    pub(crate) inner: Arc<Inner<C, V>>,
}

impl<C: StackContext, V: VmPort> Clone for CoopScheduler<C, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: StackContext, V: VmPort> CoopScheduler<C, V> {
    /// Create a scheduler bridged to the given virtual machine.
    pub fn new(vm: V) -> Self {
        Self {
            inner: Arc::new(Inner {
                vm,
                registry: Registry::new(),
                active: Mutex::new(Vec::new()),
                current: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                joinable_running: AtomicUsize::new(0),
                joinable: AtomicUsize::new(0),
                total: AtomicUsize::new(0),
                nested_warned: AtomicBool::new(false),
            }),
        }
    }

    /// Access the virtual-machine port.
    pub fn vm(&self) -> &V {
        &self.inner.vm
    }

    /// Register a thread identity bound to a fresh trap slot.
    ///
    /// Registration is a setup-time operation; the registry holds at most
    /// [`MAX_THREADS`](crate::MAX_THREADS) identities and never shrinks.
    pub fn register(&self, name: &str) -> Result<Tid, RegisterError> {
        self.inner.registry.register(&self.inner.vm, name)
    }

    /// Register `len` identities sharing one contiguous trap range.
    ///
    /// Returns the base identity; the others follow sequentially. Each
    /// member is independently startable.
    pub fn register_group(&self, name: &str, len: usize) -> Result<Tid, RegisterError> {
        self.inner.registry.register_group(&self.inner.vm, name, len)
    }

    /// Resolve the `offset`-th member of a grouped registration.
    ///
    /// Fatal if `base` does not head a group of at least `offset + 1`
    /// identities.
    pub fn group_member(&self, base: Tid, offset: usize) -> Tid {
        let thr = self.inner.registry.get(base);
        assert!(
            offset < thr.group_len,
            "offset {} outside group \"{}\" of {}",
            offset,
            thr.name,
            thr.group_len
        );
        Tid::from_raw(base.index() + offset)
    }

    /// Number of registered identities.
    pub fn registered(&self) -> usize {
        self.inner.registry.len()
    }

    /// Live activations across all identities.
    pub fn live(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Live attached (joinable) activations.
    pub fn joinable(&self) -> usize {
        self.inner.joinable.load(Ordering::Acquire)
    }

    /// Install the attach/detach handler pair for an identity. On a group
    /// base, fans out across the whole group.
    pub fn set_context_handlers(
        &self,
        tid: Tid,
        pre: Option<IdentityHook>,
        post: Option<IdentityHook>,
    ) {
        for thr in self.inner.registry.group(tid) {
            thr.set_ctx_handlers(pre.clone(), post.clone());
        }
    }

    /// Install the sleep-transition handler pair for an identity. On a
    /// group base, fans out across the whole group.
    pub fn set_sleep_handlers(
        &self,
        tid: Tid,
        pre: Option<IdentityHook>,
        post: Option<IdentityHook>,
    ) {
        for thr in self.inner.registry.group(tid) {
            thr.set_sleep_handlers(pre.clone(), post.clone());
        }
    }

    /// Install the permanent completion handler, fired after every
    /// activation of the identity that completes without being cancelled.
    pub fn set_permanent_post_handler(
        &self,
        tid: Tid,
        hook: impl Fn(Tid) + Send + Sync + 'static,
    ) {
        let hook: IdentityHook = Arc::new(hook);
        for thr in self.inner.registry.group(tid) {
            thr.set_post_handler(hook.clone());
        }
    }

    /// New activations of this identity start without diverting guest
    /// control flow (not joinable, driven by [`run`](Self::run)).
    pub fn set_detached(&self, tid: Tid) {
        self.inner.registry.get(tid).set_detached();
    }

    /// New activations of this identity start asleep and run only after a
    /// [`wake`](Self::wake).
    pub fn init_sleeping(&self, tid: Tid) {
        self.inner.registry.get(tid).set_init_sleep();
    }

    /// Start a new activation of `tid` running `body`.
    ///
    /// Unless the identity is detached, the activation is attached
    /// immediately: the guest return point is saved and guest control flow
    /// is diverted to the identity's trampoline, so the caller's emulation
    /// loop will drive the body and can observe its completion. Detached
    /// activations are instead driven one step right away.
    ///
    /// Exceeding [`MAX_RECUR_DEPTH`] concurrent activations of one identity
    /// is a programming error and panics after logging every live
    /// activation's state.
    pub fn start<F>(&self, tid: Tid, body: F)
    where
        F: FnOnce(&mut Coop<C, V>) -> BodyResult + Send + 'static,
    {
        let thr = self.inner.registry.get(tid);
        if thr.depth() >= MAX_RECUR_DEPTH {
            log::error!(
                "recursion depth exceeded for thread {} \"{}\" offset {:#x}",
                tid,
                thr.name,
                thr.offset
            );
            for (i, act) in thr.activations().iter().enumerate() {
                log::error!("  activation {} state {:?}", i, act.state());
            }
            panic!("thread recursion depth exceeded");
        }

        let act = Arc::new(Activation::new(tid, thr.init_sleep()));
        let entry_act = act.clone();
        let sched = self.clone();
        let entry: ContextEntry = Box::new(move |resumer| {
            run_body(entry_act, resumer, sched, body);
        });
        let context = match C::create(entry, STACK_SIZE) {
            Ok(context) => context,
            Err(e) => {
                log::error!("thread create failure: {}", e);
                panic!("context creation failed");
            }
        };
        act.put_context(context);
        act.set_state(RunState::Starting);

        if thr.push_activation(act.clone()) {
            self.activate_tid(tid);
        }
        self.inner.total.fetch_add(1, Ordering::AcqRel);

        if !thr.is_detached() {
            self.attach_seq(&thr, &act);
        } else {
            self.thread_run(&thr, &act);
        }
    }

    /// Drive every detached activation one step.
    ///
    /// Call once per iteration of the host's main loop. No-op while any
    /// body is already executing.
    pub fn run(&self) {
        // The synchronous-cancel path resumes a body without holding the
        // dispatcher count, so check the current-thread stack as well.
        if self.inner.running.load(Ordering::Acquire) > 0 || self.current_tid().is_some() {
            return;
        }
        let tids: Vec<Tid> = self.inner.active.lock().clone();
        for tid in tids {
            let thr = self.inner.registry.get(tid);
            // The active set may shrink while we walk the snapshot.
            let Some(act) = thr.top() else { continue };
            if act.attached() {
                continue;
            }
            self.thread_run(&thr, &act);
        }
    }

    /// Transition a sleeping activation to awaken. Fatal if the current
    /// activation of `tid` is not sleeping.
    pub fn wake(&self, tid: Tid) {
        let thr = self.inner.registry.get(tid);
        Self::awaken(&thr.current());
    }

    /// Request that the current activation of a detached identity go to
    /// sleep at its next dispatch.
    ///
    /// The caller cannot know the activation's instantaneous state, so the
    /// request is latched rather than applied; only detached identities
    /// support this.
    pub fn async_sleep(&self, tid: Tid) {
        let thr = self.inner.registry.get(tid);
        assert!(thr.is_detached(), "async sleep on a non-detached thread");
        let act = thr.current();
        assert!(!act.attached(), "async sleep on an attached activation");
        act.request_sleep();
    }

    /// Cancel the current activation of `tid`.
    ///
    /// No-op once the activation has announced it is leaving. An attached
    /// sleeper is woken so it can observe the cancellation; a detached
    /// activation is synchronously drained through the dispatcher and must
    /// report completion.
    pub fn cancel(&self, tid: Tid) {
        let thr = self.inner.registry.get(tid);
        let act = thr.current();
        if act.is_leaving() {
            return;
        }
        if let Some(current) = self.current_tid() {
            assert_ne!(current, tid, "cancelling own thread");
        }
        self.do_cancel(&thr, &act);
    }

    /// Spin `drive` until the current activation of `tid` completes.
    ///
    /// Returns immediately if the identity has no live activation. Only
    /// attached activations are awaitable; joining a detached one is a
    /// programming error.
    pub fn join(&self, tid: Tid, mut drive: impl FnMut()) {
        let thr = self.inner.registry.get(tid);
        let Some(act) = thr.top() else { return };
        assert!(act.attached(), "joining a detached thread");
        while act.state() != RunState::None {
            drive();
        }
    }

    /// Best-effort shutdown: cancel and join whichever attached activation
    /// the guest is currently parked on, until none can be located that
    /// way. Returns the number of attached activations left stalled.
    pub fn flush(&self, mut drive: impl FnMut()) -> usize {
        if let Some(tid) = self.current_tid() {
            let act = self.inner.registry.get(tid).current();
            assert!(!act.attached(), "flush from an attached thread");
        }
        while self.inner.joinable.load(Ordering::Acquire) > 0 {
            // Sleeping threads are unlikely to be found this way; this
            // mainly drains activations that already finished their body.
            let Some(tid) = self.addressed_thread() else { break };
            let thr = self.inner.registry.get(tid);
            let act = thr.current();
            assert!(act.attached(), "trap-addressed activation is detached");
            self.do_cancel(&thr, &act);
            while act.state() != RunState::None {
                drive();
            }
        }
        let stalled = self.inner.joinable.load(Ordering::Acquire);
        if stalled > 0 {
            log::warn!("{} threads stalled", stalled);
        }
        stalled
    }

    /// Tear down every detached activation at host shutdown.
    ///
    /// Attached activations cannot be safely destroyed without joining, so
    /// they are logged and left for the caller; each detached activation is
    /// logged and cancelled, restarting the scan after every removal since
    /// cancellation shrinks the active set. May be called from inside a
    /// detached body, which is skipped.
    pub fn shutdown_all(&self) {
        let own = self.current_tid();
        if let Some(tid) = own {
            let act = self.inner.registry.get(tid).current();
            assert!(!act.attached(), "shutdown from an attached thread");
        }
        let own_live = own.is_some() as usize;
        if self.inner.total.load(Ordering::Acquire)
            > self.inner.joinable.load(Ordering::Acquire) + own_live
        {
            log::error!("not all detached threads properly shut down");
        }
        'rescan: loop {
            let total = self.inner.total.load(Ordering::Acquire);
            let tids: Vec<Tid> = self.inner.active.lock().clone();
            for tid in tids {
                if own == Some(tid) {
                    continue;
                }
                let thr = self.inner.registry.get(tid);
                let Some(act) = thr.top() else { continue };
                if !act.attached() {
                    log::error!(
                        "tid={} state={:?} name=\"{}\" offset={:#x}",
                        tid,
                        act.state(),
                        thr.name,
                        thr.offset
                    );
                    self.do_cancel(&thr, &act);
                    assert_eq!(
                        self.inner.total.load(Ordering::Acquire),
                        total - 1,
                        "cancelled thread did not go away"
                    );
                    continue 'rescan;
                }
                log::debug!(
                    "tid={} state={:?} name={} offset={:#x}",
                    tid,
                    act.state(),
                    thr.name,
                    thr.offset
                );
            }
            break;
        }
        assert_eq!(
            self.inner.total.load(Ordering::Acquire),
            self.inner.joinable.load(Ordering::Acquire) + own_live,
            "detached threads remain after shutdown"
        );
    }

    /// Push an opaque value onto the current activation of `tid`.
    pub fn push_user_data(&self, tid: Tid, value: crate::activation::UserData) {
        self.inner.registry.get(tid).current().push_udata(value);
    }

    /// Pop the most recently pushed user-data value of the current
    /// activation of `tid`.
    pub fn pop_user_data(&self, tid: Tid) -> crate::activation::UserData {
        self.inner.registry.get(tid).current().pop_udata()
    }

    /// Identity of the innermost body currently executing, if any.
    pub(crate) fn current_tid(&self) -> Option<Tid> {
        self.inner.current.lock().last().copied()
    }

    fn activate_tid(&self, tid: Tid) {
        let mut active = self.inner.active.lock();
        assert!(active.len() < MAX_ACTIVE, "too many active thread identities");
        debug_assert!(!active.contains(&tid));
        active.push(tid);
    }
}
