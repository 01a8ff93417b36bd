//! I/O helpers for planrun commands.

pub mod config;
pub mod context_files;
pub mod git;
pub mod help;
pub mod plan_store;
pub mod post_checks;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod telemetry;
