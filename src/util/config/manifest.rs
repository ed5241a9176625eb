//! Program manifests
//!
//! A manifest describes a partitioned program without its compiled code:
//! task names, backends, candidate devices, region sizes and edges. Building
//! it yields schedules, a module holding zeroed constants, and static
//! backends serving no-op artifacts, enough to plan placements.
//!
//! Every task also gets an instrumented variant whose bundle carries a
//! `{task}.trace` placeholder. Its entry point stamps the start and end of
//! the call into two 64-bit slots, reported as one complete trace event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::runtime::artifact::{CompiledArtifact, CompiledFunction, InvocationError};
use crate::runtime::backend::{BackendRegistry, StaticBackend};
use crate::runtime::bundle::RuntimeBundleBuilder;
use crate::runtime::dag::{DagList, Schedule};
use crate::runtime::device::DeviceId;
use crate::runtime::module::Module;
use crate::runtime::trace::{timestamp_micros, TimestampWidth, TraceInfo};

/// Slots in a trace backing tensor: call start, call end.
const TRACE_SLOTS: usize = 2;

fn default_backend() -> String {
    "CPU".to_string()
}

fn default_logical_devices() -> Vec<DeviceId> {
    vec![0]
}

/// One schedule of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleManifest {
    /// Root function name
    pub name: String,
    /// Tasks in index order
    #[serde(default)]
    pub tasks: Vec<TaskManifest>,
}

/// One task of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    /// Function name
    pub name: String,
    /// Backend kind
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Candidate logical devices
    #[serde(default = "default_logical_devices")]
    pub logical_devices: Vec<DeviceId>,
    /// Size of the constants region
    #[serde(default)]
    pub constant_bytes: usize,
    /// Size of the mutable-weight region
    #[serde(default)]
    pub placeholder_bytes: usize,
    /// Size of the activation region
    #[serde(default)]
    pub activation_bytes: usize,
    /// Names of tasks depending on this one
    #[serde(default)]
    pub children: Vec<String>,
}

impl ScheduleManifest {
    /// Check that every child names a task of this schedule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for task in &self.tasks {
            if task.logical_devices.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "task `{}` of schedule `{}` has no logical devices",
                    task.name, self.name
                )));
            }
            for child in &task.children {
                if !self.tasks.iter().any(|t| &t.name == child) {
                    return Err(ConfigError::Invalid(format!(
                        "task `{}` of schedule `{}` has unknown child `{}`",
                        task.name, self.name, child
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything needed to provision a manifest.
#[derive(Debug)]
pub struct Program {
    /// One schedule per root
    pub schedules: DagList,
    /// Functions, placeholders and constants of every task
    pub module: Arc<Module>,
    /// One static backend per backend kind
    pub backends: BackendRegistry,
}

impl Program {
    /// Build schedules, module and backends from manifests.
    pub fn from_manifests(manifests: &[ScheduleManifest]) -> Result<Self, ConfigError> {
        let mut module = Module::new();
        let mut backends: HashMap<String, Arc<StaticBackend>> = HashMap::new();

        for manifest in manifests {
            manifest.validate()?;
            for task in &manifest.tasks {
                if !module.add_function(task.name.clone()) {
                    continue;
                }
                let (compiled, instrumented) = describe(task, &mut module)?;
                let backend = backends
                    .entry(task.backend.clone())
                    .or_insert_with(|| Arc::new(StaticBackend::new(task.backend.clone())));
                backend.register(task.name.clone(), compiled);
                backend.register_instrumented(task.name.clone(), instrumented);
            }
        }

        let stripped = Arc::new(module.stripped());
        let schedules = manifests
            .iter()
            .map(|manifest| build_schedule(manifest, &stripped))
            .collect();
        let module = Arc::new(module);
        let backends = backends
            .into_values()
            .fold(BackendRegistry::new(), |registry, backend| registry.with(backend));

        Ok(Self {
            schedules,
            module,
            backends,
        })
    }
}

/// Register the task's symbols in `module` and lay out its plain and
/// instrumented bundles.
fn describe(
    task: &TaskManifest,
    module: &mut Module,
) -> Result<(CompiledFunction, CompiledFunction), ConfigError> {
    let invalid =
        |message: String| ConfigError::Invalid(format!("task `{}`: {}", task.name, message));

    let mut builder = RuntimeBundleBuilder::new();
    if task.constant_bytes > 0 {
        let name = format!("{}.weights", task.name);
        module.add_constant(name.clone(), vec![0u8; task.constant_bytes]);
        builder = builder.constant(name, task.constant_bytes);
    }
    if task.placeholder_bytes > 0 {
        let name = format!("{}.io", task.name);
        module.add_placeholder(name.clone(), task.placeholder_bytes);
        builder = builder.placeholder(name, task.placeholder_bytes);
    }
    if task.activation_bytes > 0 {
        builder = builder.activation(format!("{}.scratch", task.name), task.activation_bytes);
    }

    let width = TimestampWidth::U64;
    let backing = format!("{}.trace", task.name);
    let backing_size = TRACE_SLOTS * width.bytes();
    module.add_placeholder(backing.clone(), backing_size);
    let instrumented_bundle = builder
        .clone()
        .placeholder(backing.clone(), backing_size)
        .build()
        .map_err(|err| invalid(err.to_string()))?;
    let bundle = builder.build().map_err(|err| invalid(err.to_string()))?;

    let offset = instrumented_bundle
        .symbol(&backing)
        .map(|info| info.offset)
        .ok_or_else(|| invalid(format!("symbol `{}` missing after layout", backing)))?;
    let mut trace_info = TraceInfo::new(width);
    trace_info.add_complete(backing, task.name.clone(), 0, 1);
    let artifact = CompiledArtifact::new(task.name.clone())
        .with_entry(move |buffers| {
            let slots = buffers
                .mutable_weights
                .get_mut(offset..offset + backing_size)
                .ok_or_else(|| InvocationError::new("trace backing outside mutable weights"))?;
            width.write(slots, 0, timestamp_micros());
            width.write(slots, 1, timestamp_micros());
            Ok(())
        })
        .with_trace_info(trace_info);

    Ok((
        CompiledFunction::new(CompiledArtifact::noop(task.name.clone()), bundle),
        CompiledFunction::new(artifact, instrumented_bundle),
    ))
}

fn build_schedule(
    manifest: &ScheduleManifest,
    module: &Arc<Module>,
) -> Schedule {
    let mut schedule = Schedule::new(manifest.name.clone()).with_module(Arc::clone(module));
    let mut indices = HashMap::new();
    for task in &manifest.tasks {
        let index = schedule.add_task(
            task.name.clone(),
            task.backend.clone(),
            task.logical_devices.iter().copied(),
        );
        indices.entry(task.name.as_str()).or_insert(index);
    }
    for (parent, task) in manifest.tasks.iter().enumerate() {
        for child in &task.children {
            if let Some(&child) = indices.get(child.as_str()) {
                schedule.add_child(parent, child);
            }
        }
    }
    schedule
}
