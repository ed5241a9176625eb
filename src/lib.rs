//! nnrt: a host-side runtime for partitioned neural network programs
//!
//! A program is split into per-device functions arranged as a DAG. The
//! runtime compiles each function with its backend, places it on a device
//! whose memory budget fits the function's runtime bundle, and then runs
//! requests through the DAG, copying bound tensors in and out of each
//! function's device memory.
//!
//! # Example
//!
//! ```rust
//! use nnrt::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str(
//!     r#"
//! [[devices]]
//! name = "CPU"
//!
//! [[schedules]]
//! name = "root0"
//!
//! [[schedules.tasks]]
//! name = "function0"
//! placeholder_bytes = 256
//! "#,
//! )
//! .unwrap();
//!
//! let plan = nnrt::plan(&config).unwrap();
//! assert_eq!(plan.placements().count(), 1);
//! ```

#![doc(html_root_url = "https://docs.rs/nnrt")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::context::{ExecutionContext, PlaceholderBindings, Tensor};
pub use runtime::dag::{DagList, Schedule, Task};
pub use runtime::device::{DeviceManager, DeviceManagerMap, HostDeviceManager};
pub use runtime::provisioner::{Placement, ProvisionError, Provisioner};
pub use runtime::scheduler::{Dispatcher, RunReport};

use std::sync::Arc;

use tracing::{debug, info};

use crate::runtime::trace::TraceContext;
use crate::util::config::{Program, RuntimeConfig};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "nnrt";

/// A provisioned program
#[derive(Debug)]
pub struct Plan {
    /// Provisioned schedules and their module
    pub program: Program,
    /// Provisioner holding the placements
    pub provisioner: Provisioner,
}

impl Plan {
    /// Placements in provisioning order.
    pub fn placements(&self) -> impl Iterator<Item = (&str, Placement)> {
        self.provisioner.placements()
    }
}

/// Outcome of one request over every schedule of a program
#[derive(Debug)]
pub struct RunOutcome {
    /// One report per schedule, in manifest order
    pub reports: Vec<RunReport>,
    /// Bindings after the last schedule ran
    pub bindings: PlaceholderBindings,
    /// Collected trace events, when tracing is enabled
    pub trace: Option<TraceContext>,
}

/// Build and provision the program described by `config`.
pub fn plan(config: &RuntimeConfig) -> Result<Plan> {
    let mut program = config
        .build_program()
        .context("Failed to build program")?;
    let backends = std::mem::take(&mut program.backends);
    let mut provisioner = Provisioner::new(config.build_devices(), backends);

    debug!(schedules = program.schedules.len(), "provisioning program");
    provisioner
        .provision(
            &mut program.schedules,
            &program.module,
            &config.compile_options(),
        )
        .context("Failed to provision program")?;
    info!(
        placements = provisioner.placements().count(),
        "program provisioned"
    );

    Ok(Plan {
        program,
        provisioner,
    })
}

/// Provision the program described by `config` and run one request
/// through each of its schedules.
///
/// Placeholders a schedule's module declares but `bindings` leaves unbound
/// are allocated zeroed before that schedule runs.
pub fn run(
    config: &RuntimeConfig,
    bindings: PlaceholderBindings,
) -> Result<RunOutcome> {
    let plan = plan(config)?;
    let mut dispatcher =
        Dispatcher::with_config(plan.provisioner.devices(), config.dispatcher.clone())
            .context("Failed to start dispatcher")?;

    let ctx = Arc::new(match config.trace_context() {
        Some(trace) => ExecutionContext::with_trace(bindings, trace),
        None => ExecutionContext::new(bindings),
    });

    let mut reports = Vec::with_capacity(plan.program.schedules.len());
    for schedule in &plan.program.schedules {
        if let Some(module) = &schedule.module {
            let added = ctx.bindings().allocate(module);
            debug!(schedule = %schedule.function_name, added, "allocated placeholders");
        }
        let report = dispatcher
            .run(schedule, Arc::clone(&ctx))
            .with_context(|| format!("Failed to run schedule `{}`", schedule.function_name))?;
        reports.push(report);
    }
    dispatcher.shutdown();

    let ctx = Arc::try_unwrap(ctx)
        .map_err(|_| anyhow::anyhow!("execution context still shared after dispatch"))?;
    let (bindings, trace) = ctx.into_parts();
    Ok(RunOutcome {
        reports,
        bindings,
        trace,
    })
}
