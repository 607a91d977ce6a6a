//! `fanout` runtime library.
//!
//! Resolves a layered host inventory (`inventory`) into targets, fans one
//! command or file-tree copy out over them on a bounded worker pool
//! (`bounded_executor`, `dispatch`), and aggregates the outcomes for the
//! console (`report`). Remote work goes through the `session` traits; the
//! SSH implementation is in `ssh`.
//!
//! Invariants:
//! - at most `forks` sessions are open at once
//! - every target yields exactly one outcome, recorded exactly once
//! - each task has its own deadline; expiry aborts only that task
//! - per-target failures never abort the run

pub mod bounded_executor;
pub mod config;
pub mod dispatch;
pub mod inventory;
pub mod report;
pub mod session;
pub mod ssh;
pub mod transfer;
