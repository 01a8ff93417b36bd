//! Deterministic, pure logic shared by the plan runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod auto_commit;
pub mod capabilities;
pub mod classifier;
pub mod invariants;
pub mod migrate;
pub mod normalize;
pub mod redact;
pub mod selector;
pub mod state_update;
pub mod types;
