//! Red-Green-Refactor cycle orchestrator.
//!
//! Tracks one active development cycle, validates its phase transitions,
//! snapshots and restores files for rollback, and normalizes the output of
//! external JavaScript test runners. The crate is split the same way the
//! state machine is:
//!
//! - **[`core`]**: Pure, deterministic logic (types, transition table, output
//!   parsing, backoff and circuit breaking). No I/O.
//! - **[`io`]**: Side effects (state document, files, test processes, HTTP),
//!   each behind a trait where tests need a fake.
//!
//! [`cycle`] coordinates the two to execute the [`action`] requests the CLI
//! receives.

pub mod action;
pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
