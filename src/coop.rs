//! Suspension API available inside a running thread body.
//!
//! A body receives `&mut Coop` and nothing else, so every operation here is
//! statically confined to a running activation's own context; no "are we
//! inside a thread?" runtime check is needed. The cancellation points
//! (`yield_now`, `wait`, `sleep`) return [`BodyResult`] and bodies
//! propagate the unwind with `?`.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::activation::{
    Activation, BodyResult, Completion, SwitchReason, Unwind, UserData,
};
use crate::context::{Resumer, StackContext};
use crate::registry::Tid;
use crate::sched::CoopScheduler;
use crate::vm::VmPort;

/// Handle a running thread body uses to suspend itself and to manipulate
/// its own activation.
pub struct Coop<C: StackContext, V: VmPort> {
    act: Arc<Activation<C, V>>,
    resumer: Box<dyn Resumer>,
    sched: CoopScheduler<C, V>,
}

impl<C: StackContext, V: VmPort> Coop<C, V> {
    /// Report `reason` and hand control back to the dispatcher. Returns when
    /// the activation is resumed.
    fn switch(&mut self, reason: SwitchReason) {
        self.act.set_reason(reason);
        self.resumer.resume();
    }

    /// Cancellation point.
    fn check_cancel(&self) -> BodyResult {
        if self.act.cancelled() {
            Err(Unwind::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ensure_attached(&self) {
        assert!(self.act.attached(), "not allowed for a detached thread");
    }

    /// Identity of the running activation.
    pub fn tid(&self) -> Tid {
        self.act.tid()
    }

    /// The scheduler driving this activation, for starting or waking other
    /// threads from inside a body.
    pub fn scheduler(&self) -> &CoopScheduler<C, V> {
        &self.sched
    }

    /// Give up the processor until the next dispatcher pass.
    ///
    /// Valid only for detached activations; attached bodies use [`wait`]
    /// (`Coop::wait`) instead.
    pub fn yield_now(&mut self) -> BodyResult {
        assert!(!self.act.attached(), "yield from an attached thread");
        self.switch(SwitchReason::Yield);
        self.check_cancel()
    }

    /// Transfer control to other guest code without suspending this
    /// activation's logical state.
    ///
    /// Valid only while attached, and only when the guest is not already
    /// parked on this activation's own trampoline.
    pub fn sched(&mut self) {
        self.ensure_attached();
        // Switching to our own trap slot would re-enter this activation
        // instead of running guest code.
        assert!(
            self.sched.addressed_thread() != Some(self.act.tid()),
            "scheduling control to own trampoline"
        );
        self.switch(SwitchReason::Sched);
    }

    /// Suspend until the dispatcher makes progress on the guest side.
    /// Valid only while attached.
    pub fn wait(&mut self) -> BodyResult {
        self.ensure_attached();
        self.switch(SwitchReason::Wait);
        self.check_cancel()
    }

    /// Park until an explicit [`CoopScheduler::wake`].
    pub fn sleep(&mut self) -> BodyResult {
        self.switch(SwitchReason::Sleep);
        self.check_cancel()
    }

    /// Divert guest control flow into this activation. No-op if already
    /// attached.
    pub fn attach(&mut self) {
        if self.act.attached() {
            return;
        }
        self.switch(SwitchReason::Attach);
    }

    /// Restore guest control flow to its saved return point. No-op if
    /// already detached.
    pub fn detach(&mut self) {
        if !self.act.attached() {
            return;
        }
        self.switch(SwitchReason::Detach);
    }

    /// Announce that the body has begun exiting: later cancellation requests
    /// become no-ops, and an attached activation detaches now so the guest
    /// resumes without waiting for the body to finish.
    pub fn leave(&mut self) {
        self.act.set_leaving();
        if !self.act.attached() {
            return;
        }
        self.switch(SwitchReason::Detach);
    }

    /// Terminate the body from any depth: `return co.exit();`
    ///
    /// Completion handlers do not fire for an explicit exit, but unlike
    /// cancellation the cleanup handler does not run either.
    pub fn exit(&mut self) -> BodyResult {
        Err(Unwind::Exited)
    }

    /// The identity whose trampoline the guest is currently parked on, if
    /// any. Valid only while attached.
    pub fn scheduled_tid(&self) -> Option<Tid> {
        self.ensure_attached();
        self.sched.addressed_thread()
    }

    /// Push an opaque value onto this activation's user-data stack.
    pub fn push_user_data(&mut self, value: UserData) {
        self.act.push_udata(value);
    }

    /// Pop the most recently pushed user-data value.
    pub fn pop_user_data(&mut self) -> UserData {
        self.act.pop_udata()
    }

    /// Register a completion handler, fired once after the body returns
    /// normally. At most [`MAX_POST_HOOKS`](crate::MAX_POST_HOOKS) per
    /// activation, fired in registration order.
    pub fn on_completion(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.act.push_post_hook(Box::new(hook));
    }

    /// Register a one-shot handler fired the next time this activation
    /// suspends (yield, wait or sleep).
    pub fn on_next_sleep(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.act.set_sleep_hook(Box::new(hook));
    }

    /// Register the cleanup handler run if the body unwinds through
    /// cancellation.
    pub fn on_cancel_cleanup(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.act.set_cleanup_hook(Box::new(hook));
    }
}

/// Trampoline executed as the context entry of every activation.
pub(crate) fn run_body<C, V, F>(
    act: Arc<Activation<C, V>>,
    resumer: Box<dyn Resumer>,
    sched: CoopScheduler<C, V>,
    body: F,
) where
    C: StackContext,
    V: VmPort,
    F: FnOnce(&mut Coop<C, V>) -> BodyResult + Send + 'static,
{
    if act.cancelled() {
        // Cancelled before the first run; no cleanups are registered yet.
        act.set_completion(Completion::Cancelled);
        act.set_reason(SwitchReason::Done);
        return;
    }

    let mut coop = Coop { act: act.clone(), resumer, sched };
    let completion = match body(&mut coop) {
        Ok(()) => Completion::Normal,
        Err(Unwind::Cancelled) => {
            if let Some(cleanup) = act.take_cleanup_hook() {
                cleanup();
            }
            Completion::Cancelled
        }
        Err(Unwind::Exited) => Completion::Exited,
    };
    drop(coop);

    act.set_completion(completion);
    act.set_reason(SwitchReason::Done);
}
