//! Execution engine for autonomous coding-agent loops.
//!
//! Runs one task attempt at a time against interchangeable worker CLIs
//! (claude, codex, gemini, opencode): resolve binaries, pick a model, supervise
//! the child process, classify the outcome, then retry, rotate or fail over.
//!
//! - **[`core`]**: Pure logic (argv construction, selection, classification,
//!   backoff). No I/O.
//! - **[`io`]**: Binary discovery, process supervision, configuration.
//!
//! [`engine`] ties the two together into the attempt loop.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
