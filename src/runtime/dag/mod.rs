//! Partition DAG model
//!
//! A compiled program is a [`DagList`]: one [`Schedule`] per root function.
//! Each schedule is an arena of [`Task`]s connected by parent/child edges.
//!
//! # Architecture
//!
//! - [`Task`](task::Task) - One partition: function name, backend, candidate
//!   logical devices, assigned physical devices and memory plan
//! - [`Schedule`](schedule::Schedule) - Index-stable task arena with edges
//! - [`DagError`](schedule::DagError) - Errors found while walking a schedule
//!
//! Schedules are logically immutable once built; only the provisioner writes
//! `Task::devices` and attaches runtime bundles.

pub mod schedule;
pub mod task;

pub use schedule::{DagError, DagList, Schedule};
pub use task::{LogicalDevices, Task, TaskIndex};

#[cfg(test)]
mod tests;
