//! Scheduler test suite.
//!
//! Unit tests for individual types live next to the types themselves; the
//! modules here exercise whole lifecycles through the public API, with
//! [`helpers::MockVm`] standing in for the emulated CPU.

pub(crate) mod helpers;

mod shutdown;
mod suspend;
