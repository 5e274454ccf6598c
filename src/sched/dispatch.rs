//! State-machine dispatcher and attach/detach bridge.
//!
//! Everything here runs on the single driving thread, either from the
//! guest trap dispatcher ([`CoopScheduler::dispatch_trap`]) or from the
//! main-loop pump ([`CoopScheduler::run`](super::CoopScheduler::run)). One
//! invocation advances one activation through its states until it parks,
//! suspends or completes.

use alloc::sync::Arc;

use portable_atomic::Ordering;

use super::CoopScheduler;
use crate::activation::{Activation, Completion, RunState, SwitchReason};
use crate::context::StackContext;
use crate::registry::{CoopThread, Tid};
use crate::vm::{TrapAddr, VmPort};

impl<C: StackContext, V: VmPort> CoopScheduler<C, V> {
    /// React to the guest program counter reaching a registered trap slot.
    ///
    /// This is the entry point the emulator's trap dispatcher calls. The
    /// addressed identity must have a live activation; anything else means
    /// the guest and the scheduler have diverged, which is fatal.
    pub fn dispatch_trap(&self, addr: TrapAddr) {
        let Some(tid) = self.inner.registry.resolve_trap(addr) else {
            log::error!("trap {:#x} does not map to a registered thread", addr);
            panic!("trap dispatch to an unregistered thread");
        };
        let thr = self.inner.registry.get(tid);
        let act = thr.current();
        self.thread_run(&thr, &act);
    }

    /// Drive one activation through the state machine.
    pub(crate) fn thread_run(&self, thr: &Arc<CoopThread<C, V>>, act: &Arc<Activation<C, V>>) {
        loop {
            match act.state() {
                RunState::None => {
                    log::error!("switch to inactive thread {} \"{}\"", thr.tid, thr.name);
                    panic!("dispatch to an inactive activation");
                }
                RunState::Starting => {
                    act.set_state(RunState::Running);
                }
                RunState::Awaken => {
                    if let Some(hook) = thr.sleep_post() {
                        hook(thr.tid);
                    }
                    act.set_state(RunState::Running);
                }
                RunState::Running => {
                    if act.take_set_sleep() {
                        act.set_state(RunState::Sleeping);
                        continue;
                    }
                    // Two kinds of recursion can reach this point: a body
                    // that starts another identity and returns (recursive
                    // invocation), and a body that re-enters the guest loop
                    // and starts an attached identity from there (nested
                    // invocation). The latter makes joinable completion
                    // ordering hard to reason about, so it is flagged once.
                    let jr = self.inner.joinable_running.load(Ordering::Acquire);
                    if act.attached() {
                        if jr > 0 && !self.inner.nested_warned.swap(true, Ordering::AcqRel) {
                            log::warn!("nested thread invocation detected, please fix");
                        }
                        self.inner.joinable_running.store(jr + 1, Ordering::Release);
                    }
                    self.inner.running.fetch_add(1, Ordering::AcqRel);
                    let reason = self.run_step(thr, act);
                    self.inner.running.fetch_sub(1, Ordering::AcqRel);
                    self.inner.joinable_running.store(jr, Ordering::Release);
                    if matches!(
                        reason,
                        SwitchReason::Sleep | SwitchReason::Wait | SwitchReason::Yield
                    ) {
                        if let Some(hook) = act.take_sleep_hook() {
                            hook();
                        }
                        if let Some(hook) = thr.sleep_pre() {
                            hook(thr.tid);
                        }
                    }
                    // Even if the state is still Running, break away: the
                    // guest entry point may have changed under us.
                    break;
                }
                RunState::Sleeping => {
                    if act.attached() {
                        self.inner.vm.idle();
                    }
                    break;
                }
                RunState::Detach => {
                    self.detach_seq(thr, act);
                    act.set_state(RunState::Running);
                    // No loop here: the guest entry point just changed.
                    break;
                }
                RunState::Delete => {
                    assert!(act.attached(), "deleting an unattached activation");
                    self.detach_seq(thr, act);
                    self.delete_activation(thr, act);
                    break;
                }
            }
        }
    }

    /// Resume the activation's context once and map the reported reason
    /// onto the next state.
    pub(crate) fn run_step(
        &self,
        thr: &Arc<CoopThread<C, V>>,
        act: &Arc<Activation<C, V>>,
    ) -> SwitchReason {
        self.inner.current.lock().push(thr.tid);
        act.call_context();
        self.inner.current.lock().pop();

        let reason = act.reason();
        match reason {
            SwitchReason::Yield => {
                act.set_state(RunState::Awaken);
            }
            SwitchReason::Wait => {
                if act.attached() {
                    self.inner.vm.idle();
                }
                act.set_state(RunState::Awaken);
            }
            SwitchReason::Sleep => {
                act.set_state(RunState::Sleeping);
            }
            SwitchReason::Sched => {}
            SwitchReason::Detach => {
                act.set_state(RunState::Detach);
            }
            SwitchReason::Done => {
                if act.attached() {
                    act.set_state(RunState::Delete);
                } else {
                    self.delete_activation(thr, act);
                }
            }
            SwitchReason::Attach => {
                self.attach_seq(thr, act);
            }
        }
        reason
    }

    /// Divert guest control flow into the activation's trampoline.
    ///
    /// This and [`detach_seq`](Self::detach_seq) are the only places the
    /// scheduler touches guest control-flow state.
    pub(crate) fn attach_seq(&self, thr: &Arc<CoopThread<C, V>>, act: &Arc<Activation<C, V>>) {
        if act.attached() {
            return;
        }
        if let Some(hook) = thr.ctx_pre() {
            hook(thr.tid);
        }
        act.save_return(self.inner.vm.return_point());
        self.inner.vm.divert_to(thr.trap);
        self.inner.joinable.fetch_add(1, Ordering::AcqRel);
        act.set_attached(true);
    }

    /// Restore guest control flow to the activation's saved return point.
    pub(crate) fn detach_seq(&self, thr: &Arc<CoopThread<C, V>>, act: &Arc<Activation<C, V>>) {
        if !act.attached() {
            return;
        }
        self.inner.joinable.fetch_sub(1, Ordering::AcqRel);
        let saved = act.take_return().expect("attached activation has no return point");
        self.inner.vm.restore(saved);
        if let Some(hook) = thr.ctx_post() {
            hook(thr.tid);
        }
        act.set_attached(false);
    }

    /// Destroy a completed activation and fire its completion handlers.
    pub(crate) fn delete_activation(
        &self,
        thr: &Arc<CoopThread<C, V>>,
        act: &Arc<Activation<C, V>>,
    ) {
        act.set_state(RunState::None);
        if let Some(context) = act.take_context() {
            context.delete();
        }
        if thr.pop_activation(act) {
            self.deactivate_tid(thr.tid);
        }
        self.inner.total.fetch_sub(1, Ordering::AcqRel);

        if act.completion() == Completion::Normal {
            for hook in act.take_post_hooks() {
                hook();
            }
            if let Some(hook) = thr.post_handler() {
                hook(thr.tid);
            }
        }
    }

    pub(crate) fn do_cancel(&self, thr: &Arc<CoopThread<C, V>>, act: &Arc<Activation<C, V>>) {
        act.set_cancelled();
        if act.attached() {
            // Wake an attached sleeper so it reaches its cancellation point
            // the next time the guest drives its trampoline.
            if act.state() == RunState::Sleeping {
                Self::awaken(act);
            }
        } else {
            let reason = self.run_step(thr, act);
            assert_eq!(
                reason,
                SwitchReason::Done,
                "cancelled thread did not complete"
            );
        }
    }

    pub(crate) fn awaken(act: &Arc<Activation<C, V>>) {
        assert_eq!(
            act.state(),
            RunState::Sleeping,
            "waking a thread that is not sleeping"
        );
        act.set_state(RunState::Awaken);
    }

    /// The identity whose trap slot the guest is currently parked on, if it
    /// has a live activation.
    pub(crate) fn addressed_thread(&self) -> Option<Tid> {
        let addr = self.inner.vm.current_trap()?;
        let tid = self.inner.registry.resolve_trap(addr)?;
        if self.inner.active.lock().contains(&tid) {
            Some(tid)
        } else {
            None
        }
    }

    pub(crate) fn deactivate_tid(&self, tid: Tid) {
        let mut active = self.inner.active.lock();
        let pos = active
            .iter()
            .position(|&t| t == tid)
            .expect("deactivating an identity that is not active");
        active.remove(pos);
        debug_assert!(!active.contains(&tid));
    }
}
