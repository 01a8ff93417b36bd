//! Plan runner driving external coding-agent CLIs through a multi-step plan.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, state updates,
//!   migration, classification, redaction, capability matching).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (plan file, config, git, process
//!   execution, run log, telemetry). Isolated behind traits for tests.
//! - **[`provider`]**: One adapter per agent CLI behind the [`provider::Provider`] trait.
//!
//! Orchestration modules ([`run`], [`looping`]) coordinate core logic with I/O
//! to implement the `planrun run` command.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod plan;
pub mod provider;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
