//! Runtime system
//!
//! This module contains the partition DAG model, device provisioning,
//! artifact execution and request dispatch.
//!
//! Data flows leaves first:
//!
//! ```text
//! (Schedule, artifacts) -> Provisioner -> Dispatcher -> Executor -> bindings
//! ```

pub mod artifact;
pub mod backend;
pub mod bundle;
pub mod context;
pub mod dag;
pub mod device;
pub mod executor;
pub mod memory;
pub mod module;
pub mod provisioner;
pub mod scheduler;
pub mod trace;
