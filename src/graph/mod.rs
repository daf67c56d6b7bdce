//! Dependency graph for plan tasks.
//!
//! Two pieces:
//!
//! 1. **Builder** — validates a plan's tasks (unique ids, known dependencies,
//!    no self-reference, no cycles) and produces a `TaskGraph`
//! 2. **Scheduler** — tracks per-task status over the graph and computes the
//!    deterministic ready set for the parallel executor

mod builder;
mod scheduler;

pub use builder::{GraphBuilder, TaskGraph, TaskIndex};
pub use scheduler::TaskScheduler;
