#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Cooperative threading between a single-threaded virtual machine host and
//! its guest code.
//!
//! This library lets code emulating a guest operating system perform
//! apparently-blocking operations (disk I/O, serial handshakes, nested
//! service calls) without halting the single-threaded driver that hosts
//! it. Many logical threads, each a suspendable execution context with its
//! own stack, are multiplexed onto one physical thread of control and
//! switched only at explicit suspension points.
//!
//! # Model
//!
//! - A **thread identity** is registered once ([`CoopScheduler::register`])
//!   and bound to a guest **trap slot**: the address the guest program
//!   counter must reach for the dispatcher to run that identity.
//! - Each [`start`](CoopScheduler::start) creates an **activation**: one
//!   concurrent invocation of the identity, up to [`MAX_RECUR_DEPTH`] deep.
//! - An activation is **attached** while guest control flow is diverted
//!   into its trampoline (awaitable via [`join`](CoopScheduler::join)), or
//!   **detached**, driven from the host main loop via
//!   [`run`](CoopScheduler::run) and not awaitable.
//! - Bodies receive a [`Coop`] handle for yielding, sleeping, waiting,
//!   attaching and detaching. Cancellation is cooperative: it is observed
//!   at the suspension points that return [`BodyResult`] and propagated
//!   with `?`.
//!
//! # Collaborators
//!
//! The stack switch itself and the emulated CPU are injected:
//! [`StackContext`] is the raw coroutine primitive (an OS-thread-backed
//! implementation ships behind the `std-shim` feature for host builds), and
//! [`VmPort`] is the bridge to the guest control flow.
//!
//! # Quick start
//!
//! ```ignore
//! use coop_threads::{CoopScheduler, ThreadShimContext};
//!
//! let sched: CoopScheduler<ThreadShimContext, MyVm> = CoopScheduler::new(my_vm);
//! let tid = sched.register("int15")?;
//! sched.start(tid, |co| {
//!     co.wait()?; // suspend until the emulation loop makes progress
//!     Ok(())
//! });
//! ```

// Core modules
pub mod activation;
pub mod context;
pub mod coop;
pub mod errors;
pub mod registry;
pub mod sched;
pub mod vm;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API
// ============================================================================

// Scheduler
pub use sched::{CoopScheduler, MAX_ACTIVE, MAX_RECUR_DEPTH, STACK_SIZE};

// Thread identities
pub use registry::{IdentityHook, Tid, MAX_THREADS};

// Activations and the body-side API
pub use activation::{
    ActivationHook, BodyResult, RunState, SwitchReason, Unwind, UserData, MAX_POST_HOOKS,
    MAX_UDATA,
};
pub use coop::Coop;

// Injected collaborators
#[cfg(any(test, feature = "std-shim"))]
pub use context::ThreadShimContext;
pub use context::{ContextEntry, Resumer, StackContext};
pub use vm::{TrapAddr, VmPort};

// Errors
pub use errors::{ContextError, RegisterError};
