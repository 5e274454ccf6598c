//! Stack-switching context primitive.
//!
//! The scheduler multiplexes many suspendable execution contexts onto one
//! physical thread of control, but it does not implement the stack switch
//! itself. That mechanism is injected through [`StackContext`]: anything that
//! can run an entry function on its own stack, hand control back through a
//! [`Resumer`], and be re-entered later qualifies: a fiber library, a
//! hand-rolled assembly switcher, or the OS-thread shim shipped for host
//! builds.
//!
//! The contract the dispatcher relies on:
//!
//! - [`StackContext::call`] runs the context until its entry either calls
//!   [`Resumer::resume`] or returns. It must not return early.
//! - [`Resumer::resume`] transfers control back to the most recent caller of
//!   `call` and returns only once the context is called again.
//! - A context whose entry has returned must never be called again; it may
//!   only be passed to [`StackContext::delete`].

use alloc::boxed::Box;

use crate::errors::ContextError;

#[cfg(any(test, feature = "std-shim"))]
pub mod thread_shim;
#[cfg(any(test, feature = "std-shim"))]
pub use thread_shim::ThreadShimContext;

/// Entry function executed on the context's own stack.
///
/// The entry owns its [`Resumer`] for the lifetime of the context.
pub type ContextEntry = Box<dyn FnOnce(Box<dyn Resumer>) + Send + 'static>;

/// Handle held by a running entry to suspend itself.
pub trait Resumer: Send {
    /// Yield control back to the last caller of [`StackContext::call`].
    ///
    /// Returns when the context is called again.
    fn resume(&self);
}

/// One suspendable execution context with its own stack.
pub trait StackContext: Sized + Send + 'static {
    /// Create a context that will run `entry` on a stack of at least
    /// `stack_size` bytes once it is first called.
    fn create(entry: ContextEntry, stack_size: usize) -> Result<Self, ContextError>;

    /// Run the context until it voluntarily yields back or finishes.
    fn call(&self);

    /// Destroy a finished context and release its stack.
    fn delete(self);
}
