//! Shared test utilities for mailprint integration tests.
//!
//! - `TestHarness` for an isolated config dir, state store and spool dir
//! - In-memory fakes for the mailbox, clock, print sink and token issuer

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::{t0, TestHarness, SENDER, SKEW_SECS};
