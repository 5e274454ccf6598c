//! Shared fixtures for the scheduler test suite.
//!
//! [`MockVm`] models the guest side as a single program counter: trap slots
//! live in a reserved high window, `divert_to` points the counter at a slot
//! and `restore` points it back. [`drive`] plays the role of the emulation
//! loop's trap dispatch.

use portable_atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use crate::context::ThreadShimContext;
use crate::errors::RegisterError;
use crate::sched::CoopScheduler;
use crate::vm::{TrapAddr, VmPort};

/// Guest addresses at or above this are trap slots.
const TRAP_WINDOW: u32 = 0xF000_0000;

/// Initial guest program counter, well outside the trap window.
pub(crate) const GUEST_ENTRY: u32 = 0x1000;

pub(crate) struct MockVm {
    pc: AtomicU32,
    next_trap: AtomicU16,
    idles: AtomicUsize,
    restores: AtomicUsize,
}

impl MockVm {
    pub(crate) fn new() -> Self {
        Self {
            pc: AtomicU32::new(GUEST_ENTRY),
            next_trap: AtomicU16::new(0x10),
            idles: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pc(&self) -> u32 {
        self.pc.load(Ordering::Acquire)
    }

    /// Simulate the guest jumping to an arbitrary address.
    pub(crate) fn set_pc(&self, pc: u32) {
        self.pc.store(pc, Ordering::Release);
    }

    /// Simulate the guest returning to a trampoline slot.
    pub(crate) fn enter_trap(&self, trap: TrapAddr) {
        self.set_pc(TRAP_WINDOW + u32::from(trap));
    }

    pub(crate) fn idles(&self) -> usize {
        self.idles.load(Ordering::Acquire)
    }

    pub(crate) fn restores(&self) -> usize {
        self.restores.load(Ordering::Acquire)
    }
}

impl VmPort for MockVm {
    type Location = u32;

    fn register_trap(&self, _name: &str, len: u16) -> Result<TrapAddr, RegisterError> {
        Ok(self.next_trap.fetch_add(len, Ordering::AcqRel))
    }

    fn return_point(&self) -> u32 {
        self.pc()
    }

    fn divert_to(&self, trap: TrapAddr) {
        self.pc.store(TRAP_WINDOW + u32::from(trap), Ordering::Release);
    }

    fn restore(&self, location: u32) {
        self.restores.fetch_add(1, Ordering::AcqRel);
        self.pc.store(location, Ordering::Release);
    }

    fn current_trap(&self) -> Option<TrapAddr> {
        let pc = self.pc();
        if pc >= TRAP_WINDOW {
            Some((pc - TRAP_WINDOW) as TrapAddr)
        } else {
            None
        }
    }

    fn idle(&self) {
        self.idles.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) type TestSched = CoopScheduler<ThreadShimContext, MockVm>;

pub(crate) fn sched() -> TestSched {
    CoopScheduler::new(MockVm::new())
}

/// One step of the emulation loop: if the guest is parked on a trap slot,
/// dispatch it.
pub(crate) fn drive(s: &TestSched) {
    if let Some(addr) = s.vm().current_trap() {
        s.dispatch_trap(addr);
    }
}
