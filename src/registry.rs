//! Thread identity registry.
//!
//! Identities are registered during host setup and never removed; each one
//! is bound to a freshly allocated guest trap slot (or, for grouped
//! registration, to a contiguous range of slots sharing one allocation).
//! At steady state the registry only resolves trap addresses and hands out
//! identity records.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use portable_atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::activation::{Activation, RunState};
use crate::context::StackContext;
use crate::errors::RegisterError;
use crate::vm::{TrapAddr, VmPort};

/// Maximum number of registered thread identities.
pub const MAX_THREADS: usize = 1024;

/// Handle of one registered thread identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(usize);

impl Tid {
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback bound to a thread identity, fired with the identity's tid.
pub type IdentityHook = Arc<dyn Fn(Tid) + Send + Sync>;

/// Pre/post handler pairs and the permanent completion handler of one
/// identity.
#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) ctx_pre: Option<IdentityHook>,
    pub(crate) ctx_post: Option<IdentityHook>,
    pub(crate) sleep_pre: Option<IdentityHook>,
    pub(crate) sleep_post: Option<IdentityHook>,
    pub(crate) post: Option<IdentityHook>,
}

/// One registered thread identity and its live activations.
pub(crate) struct CoopThread<C: StackContext, V: VmPort> {
    pub(crate) tid: Tid,
    pub(crate) name: Arc<String>,
    pub(crate) trap: TrapAddr,
    /// Position inside a grouped registration, 0 for standalone identities.
    pub(crate) offset: u16,
    /// Group fan-out for handler setters: the whole group on the base
    /// identity, 1 everywhere else.
    pub(crate) group_len: usize,
    detached: AtomicBool,
    init_sleep: AtomicBool,
    handlers: Mutex<Handlers>,
    /// Stack of live activations; the top is the current one.
    stack: Mutex<Vec<Arc<Activation<C, V>>>>,
}

impl<C: StackContext, V: VmPort> CoopThread<C, V> {
    fn new(tid: Tid, name: Arc<String>, trap: TrapAddr, offset: u16, group_len: usize) -> Self {
        Self {
            tid,
            name,
            trap,
            offset,
            group_len,
            detached: AtomicBool::new(false),
            init_sleep: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            stack: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    /// The top-of-stack activation, if any is live.
    pub(crate) fn top(&self) -> Option<Arc<Activation<C, V>>> {
        self.stack.lock().last().cloned()
    }

    /// The current activation; a request against an identity with none is a
    /// programming error.
    pub(crate) fn current(&self) -> Arc<Activation<C, V>> {
        let act = self.top().expect("no live activation for thread");
        debug_assert!(act.state() != RunState::None);
        act
    }

    /// Snapshot of all live activations, innermost first.
    pub(crate) fn activations(&self) -> Vec<Arc<Activation<C, V>>> {
        self.stack.lock().clone()
    }

    /// Push a new activation; returns true if it is the identity's first.
    pub(crate) fn push_activation(&self, act: Arc<Activation<C, V>>) -> bool {
        let mut stack = self.stack.lock();
        stack.push(act);
        stack.len() == 1
    }

    /// Pop the finished top activation; returns true if none remain.
    pub(crate) fn pop_activation(&self, act: &Arc<Activation<C, V>>) -> bool {
        let mut stack = self.stack.lock();
        let top = stack.pop().expect("popping an empty activation stack");
        assert!(
            Arc::ptr_eq(&top, act),
            "completed activation is not the innermost one"
        );
        stack.is_empty()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn init_sleep(&self) -> bool {
        self.init_sleep.load(Ordering::Acquire)
    }

    pub(crate) fn set_init_sleep(&self) {
        self.init_sleep.store(true, Ordering::Release);
    }

    pub(crate) fn set_ctx_handlers(&self, pre: Option<IdentityHook>, post: Option<IdentityHook>) {
        let mut handlers = self.handlers.lock();
        handlers.ctx_pre = pre;
        handlers.ctx_post = post;
    }

    pub(crate) fn set_sleep_handlers(&self, pre: Option<IdentityHook>, post: Option<IdentityHook>) {
        let mut handlers = self.handlers.lock();
        handlers.sleep_pre = pre;
        handlers.sleep_post = post;
    }

    pub(crate) fn set_post_handler(&self, hook: IdentityHook) {
        self.handlers.lock().post = Some(hook);
    }

    pub(crate) fn ctx_pre(&self) -> Option<IdentityHook> {
        self.handlers.lock().ctx_pre.clone()
    }

    pub(crate) fn ctx_post(&self) -> Option<IdentityHook> {
        self.handlers.lock().ctx_post.clone()
    }

    pub(crate) fn sleep_pre(&self) -> Option<IdentityHook> {
        self.handlers.lock().sleep_pre.clone()
    }

    pub(crate) fn sleep_post(&self) -> Option<IdentityHook> {
        self.handlers.lock().sleep_post.clone()
    }

    pub(crate) fn post_handler(&self) -> Option<IdentityHook> {
        self.handlers.lock().post.clone()
    }
}

/// Append-only identity table plus the trap-address index.
pub(crate) struct Registry<C: StackContext, V: VmPort> {
    threads: Mutex<Vec<Arc<CoopThread<C, V>>>>,
    traps: Mutex<BTreeMap<TrapAddr, Tid>>,
}

impl<C: StackContext, V: VmPort> Registry<C, V> {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            traps: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Register one identity bound to a fresh trap slot.
    pub(crate) fn register(&self, vm: &V, name: &str) -> Result<Tid, RegisterError> {
        self.register_group(vm, name, 1)
    }

    /// Register `len` identities sharing one contiguous trap range.
    pub(crate) fn register_group(
        &self,
        vm: &V,
        name: &str,
        len: usize,
    ) -> Result<Tid, RegisterError> {
        let mut threads = self.threads.lock();
        if threads.len() + len > MAX_THREADS {
            log::error!("too many threads registering \"{}\"", name);
            return Err(RegisterError::CapacityExhausted {
                limit: MAX_THREADS,
                requested: len,
            });
        }
        let base = vm.register_trap(name, len as u16)?;
        let shared_name = Arc::new(String::from(name));
        let base_tid = Tid::from_raw(threads.len());
        let mut traps = self.traps.lock();
        for i in 0..len {
            let tid = Tid::from_raw(base_tid.index() + i);
            let trap = base + i as TrapAddr;
            let group_len = if i == 0 { len } else { 1 };
            threads.push(Arc::new(CoopThread::new(
                tid,
                shared_name.clone(),
                trap,
                i as u16,
                group_len,
            )));
            traps.insert(trap, tid);
        }
        Ok(base_tid)
    }

    /// Look up an identity; an out-of-range tid is a programming error.
    pub(crate) fn get(&self, tid: Tid) -> Arc<CoopThread<C, V>> {
        let threads = self.threads.lock();
        match threads.get(tid.index()) {
            Some(thr) => thr.clone(),
            None => {
                log::error!("wrong tid {}", tid);
                panic!("tid {} is not registered", tid);
            }
        }
    }

    /// Identities a handler setter on `tid` fans out to.
    pub(crate) fn group(&self, tid: Tid) -> Vec<Arc<CoopThread<C, V>>> {
        let base = self.get(tid);
        let threads = self.threads.lock();
        (0..base.group_len)
            .map(|i| threads[tid.index() + i].clone())
            .collect()
    }

    pub(crate) fn resolve_trap(&self, addr: TrapAddr) -> Option<Tid> {
        self.traps.lock().get(&addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadShimContext;
    use crate::tests::helpers::MockVm;

    type TestRegistry = Registry<ThreadShimContext, MockVm>;

    #[test]
    fn register_assigns_sequential_tids() {
        let vm = MockVm::new();
        let registry = TestRegistry::new();
        let a = registry.register(&vm, "disk").unwrap();
        let b = registry.register(&vm, "serial").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn group_registration_shares_a_trap_range() {
        let vm = MockVm::new();
        let registry = TestRegistry::new();
        let base = registry.register_group(&vm, "irq", 4).unwrap();
        let first = registry.get(base);
        let last = registry.get(Tid::from_raw(base.index() + 3));
        assert_eq!(first.group_len, 4);
        assert_eq!(last.group_len, 1);
        assert_eq!(last.trap, first.trap + 3);
        assert_eq!(registry.resolve_trap(first.trap + 2), Some(Tid::from_raw(2)));
    }

    #[test]
    fn capacity_is_enforced() {
        let vm = MockVm::new();
        let registry = TestRegistry::new();
        let err = registry.register_group(&vm, "huge", MAX_THREADS + 1);
        assert!(matches!(
            err,
            Err(RegisterError::CapacityExhausted { limit: MAX_THREADS, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn unknown_tid_panics() {
        let registry = TestRegistry::new();
        let _ = registry.get(Tid::from_raw(3));
    }
}
