//! Virtual-machine collaborator interface.
//!
//! The scheduler bridges two control-flow domains: its own cooperative
//! contexts and the guest program counter of an emulated CPU. [`VmPort`] is
//! the whole surface it needs from the emulator side. Attach and detach are
//! the only operations that go through [`VmPort::return_point`],
//! [`VmPort::divert_to`] and [`VmPort::restore`]; everything else in the
//! scheduler is pure bookkeeping.

use crate::errors::RegisterError;

/// Address of one trap slot in the guest address space.
///
/// When the guest program counter lands on a registered trap slot, the
/// emulator's trap dispatcher is expected to call
/// [`CoopScheduler::dispatch_trap`](crate::CoopScheduler::dispatch_trap)
/// with this address.
pub type TrapAddr = u16;

/// Bridge to the emulated CPU.
///
/// Implementations keep their own interior mutability; all calls arrive on
/// the single driving thread.
pub trait VmPort: Send + Sync + 'static {
    /// Saved guest control-flow position (a code segment and offset pair,
    /// or whatever the emulator uses).
    type Location: Send;

    /// Allocate `len` contiguous trap slots and return the base address.
    ///
    /// Called once per identity (or identity group) at registration time.
    fn register_trap(&self, name: &str, len: u16) -> Result<TrapAddr, RegisterError>;

    /// Capture the guest's current return point.
    fn return_point(&self) -> Self::Location;

    /// Divert guest control flow to the given trap slot.
    fn divert_to(&self, trap: TrapAddr);

    /// Restore a previously captured return point.
    fn restore(&self, loc: Self::Location);

    /// The trap slot the guest control flow currently points at, if any.
    fn current_trap(&self) -> Option<TrapAddr>;

    /// Park the external event loop until new work arrives.
    ///
    /// Called while an attached activation waits or sleeps, so the host does
    /// not spin the emulation loop.
    fn idle(&self);
}
