//! Provisioner: assigns tasks to physical devices
//!
//! Each task names ordered candidate *logical* devices. The provisioner binds
//! logical ids to physical devices, reserves the task's device footprint
//! (constants plus mutable weights), and loads the compiled artifact there.
//!
//! Provisioning is all-or-nothing across the whole batch: every reservation,
//! load, logical binding and device assignment made by a failing call is
//! undone in reverse order before the error is returned.

mod transaction;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runtime::artifact::CompiledFunction;
use crate::runtime::backend::{BackendError, BackendRegistry, CompileOptions};
use crate::runtime::bundle::{BundleError, RuntimeBundle};
use crate::runtime::dag::Schedule;
use crate::runtime::device::{DeviceError, DeviceId, DeviceManager, DeviceManagerMap};
use crate::runtime::module::Module;

use transaction::{Transaction, Undo};

/// Errors raised while provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// No candidate device can hold the task; the whole batch was rolled back
    #[error("no device can hold task `{task}` ({required} bytes)")]
    ResourceExhausted { task: String, required: usize },
    /// The module has no function of this name
    #[error("module has no function `{0}`")]
    UnknownFunction(String),
    /// No backend registered for the task's kind
    #[error("task `{task}` uses unknown backend `{backend}`")]
    UnknownBackend { task: String, backend: String },
    /// The backend failed to compile the task
    #[error("failed to compile task `{task}`: {source}")]
    Compile {
        task: String,
        #[source]
        source: BackendError,
    },
    /// Constants could not be collected into the task's bundle
    #[error("failed to prepare bundle of task `{task}`: {source}")]
    Bundle {
        task: String,
        #[source]
        source: BundleError,
    },
    /// A bundle placeholder disagrees in size with the module's declaration
    #[error("task `{task}` lays out placeholder `{name}` as {bundle} bytes, module declares {module}")]
    PlaceholderMismatch {
        task: String,
        name: String,
        bundle: usize,
        module: usize,
    },
    /// The chosen device refused the artifact
    #[error("device {device} refused task `{task}`: {source}")]
    Load {
        task: String,
        device: DeviceId,
        #[source]
        source: DeviceError,
    },
}

/// Where a task lives and how much it reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Physical device
    pub device: DeviceId,
    /// Reserved bytes
    pub bytes: usize,
}

/// Assigns tasks to devices under per-device memory budgets.
#[derive(Debug)]
pub struct Provisioner {
    devices: DeviceManagerMap,
    backends: BackendRegistry,
    /// Logical id -> physical id
    logical_bindings: BTreeMap<DeviceId, DeviceId>,
    /// Task name -> placement, in placement order
    placements: IndexMap<String, Placement>,
}

impl Provisioner {
    /// Create a provisioner over `devices`, compiling through `backends`.
    pub fn new(
        devices: DeviceManagerMap,
        backends: BackendRegistry,
    ) -> Self {
        Self {
            devices,
            backends,
            logical_bindings: BTreeMap::new(),
            placements: IndexMap::new(),
        }
    }

    /// Managed devices.
    #[inline]
    pub fn devices(&self) -> &DeviceManagerMap {
        &self.devices
    }

    /// Registered backends.
    #[inline]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Placement of a task, if provisioned.
    pub fn placement(
        &self,
        task: &str,
    ) -> Option<Placement> {
        self.placements.get(task).copied()
    }

    /// All placements in placement order.
    pub fn placements(&self) -> impl Iterator<Item = (&str, Placement)> {
        self.placements
            .iter()
            .map(|(name, placement)| (name.as_str(), *placement))
    }

    /// Physical device a logical id is bound to.
    pub fn logical_binding(
        &self,
        logical: DeviceId,
    ) -> Option<DeviceId> {
        self.logical_bindings.get(&logical).copied()
    }

    /// Place every task of `schedules` on a device.
    ///
    /// On error nothing made by this call remains: reservations are released,
    /// artifacts evicted, logical bindings dropped and `Task::devices` cleared.
    pub fn provision(
        &mut self,
        schedules: &mut [Schedule],
        module: &Module,
        options: &CompileOptions,
    ) -> Result<(), ProvisionError> {
        let mut txn = Transaction::default();
        match self.provision_all(schedules, module, options, &mut txn) {
            Ok(()) => {
                info!(
                    schedules = schedules.len(),
                    placed = self.placements.len(),
                    "provisioning complete"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, undo = txn.len(), "provisioning failed, rolling back");
                self.rollback(schedules, txn);
                Err(err)
            }
        }
    }

    /// Evict and release every task placed so far and clear the devices of
    /// every task in `schedules`.
    pub fn unprovision(
        &mut self,
        schedules: &mut [Schedule],
    ) {
        for (name, placement) in self.placements.drain(..) {
            if let Some(device) = self.devices.get(&placement.device) {
                device.evict(&name);
                device.release(placement.bytes);
            }
        }
        self.logical_bindings.clear();
        for schedule in schedules.iter_mut() {
            for task in schedule.tasks_mut() {
                task.clear_devices();
            }
        }
        info!("unprovisioned all tasks");
    }

    fn provision_all(
        &mut self,
        schedules: &mut [Schedule],
        module: &Module,
        options: &CompileOptions,
        txn: &mut Transaction,
    ) -> Result<(), ProvisionError> {
        let mut compiled: HashMap<String, CompiledFunction> = HashMap::new();

        for (s, schedule) in schedules.iter_mut().enumerate() {
            // Placeholder sizes come from the schedule's own module when it has one.
            let attached = schedule.module.clone();
            let declared = attached.as_deref().unwrap_or(module);
            for t in 0..schedule.len() {
                let Some(task) = schedule.task_mut(t) else {
                    continue;
                };
                let name = task.name.clone();

                if !module.has_function(&name) {
                    return Err(ProvisionError::UnknownFunction(name));
                }
                if self.backends.get(&task.backend).is_none() {
                    return Err(ProvisionError::UnknownBackend {
                        task: name,
                        backend: task.backend.clone(),
                    });
                }

                let function = match compiled.get(&name) {
                    Some(function) => function.clone(),
                    None => {
                        let function = self.compile(&name, &task.backend, module, options)?;
                        compiled.insert(name.clone(), function.clone());
                        function
                    }
                };

                let bundle = match task.runtime_bundle() {
                    Some(bundle) => prepare_bundle(&name, Arc::clone(bundle), module, options)?,
                    None => {
                        task.attach_runtime_bundle(Arc::clone(&function.bundle));
                        txn.push(Undo::Attached { schedule: s, task: t });
                        Arc::clone(&function.bundle)
                    }
                };
                check_placeholders(&name, &bundle, declared)?;

                let device = match self.placements.get(&name) {
                    Some(placement) => {
                        debug!(task = %name, device = placement.device, "reusing placement");
                        placement.device
                    }
                    None => {
                        let required = bundle.device_footprint();
                        let device = self
                            .reserve(&task.logical_devices, required, txn)
                            .ok_or_else(|| ProvisionError::ResourceExhausted {
                                task: name.clone(),
                                required,
                            })?;
                        self.load(&name, device, &function, bundle, txn)?;
                        self.placements.insert(
                            name.clone(),
                            Placement {
                                device,
                                bytes: required,
                            },
                        );
                        txn.push(Undo::Placed { task: name.clone() });
                        debug!(task = %name, device, bytes = required, "placed task");
                        device
                    }
                };

                if !task.devices().contains(&device) {
                    task.assign_device(device);
                    txn.push(Undo::Assigned {
                        schedule: s,
                        task: t,
                        device,
                    });
                }
            }
        }
        Ok(())
    }

    fn compile(
        &self,
        name: &str,
        backend: &str,
        module: &Module,
        options: &CompileOptions,
    ) -> Result<CompiledFunction, ProvisionError> {
        let backend = self
            .backends
            .get(backend)
            .ok_or_else(|| ProvisionError::UnknownBackend {
                task: name.to_string(),
                backend: backend.to_string(),
            })?;
        let mut function =
            backend
                .compile(name, module, options)
                .map_err(|source| ProvisionError::Compile {
                    task: name.to_string(),
                    source,
                })?;
        function.bundle = prepare_bundle(name, function.bundle, module, options)?;
        Ok(function)
    }

    /// Reserve `bytes` on the first candidate that accepts them.
    fn reserve(
        &mut self,
        logical_devices: &[DeviceId],
        bytes: usize,
        txn: &mut Transaction,
    ) -> Option<DeviceId> {
        for &logical in logical_devices {
            let (physical, newly_bound) = match self.logical_bindings.get(&logical) {
                Some(&physical) => (physical, false),
                None => match self.unbound_device_fitting(bytes) {
                    Some(physical) => (physical, true),
                    None => continue,
                },
            };

            let Some(device) = self.devices.get(&physical) else {
                continue;
            };
            if !device.reserve(bytes) {
                debug!(logical, physical, bytes, "candidate refused reservation");
                continue;
            }
            txn.push(Undo::Reserved {
                device: physical,
                bytes,
            });

            if newly_bound {
                self.logical_bindings.insert(logical, physical);
                txn.push(Undo::Bound { logical });
                debug!(logical, physical, "bound logical device");
            }
            return Some(physical);
        }
        None
    }

    /// Lowest-id device not bound to any logical id whose budget fits.
    fn unbound_device_fitting(
        &self,
        bytes: usize,
    ) -> Option<DeviceId> {
        let bound: HashSet<DeviceId> = self.logical_bindings.values().copied().collect();
        self.devices
            .iter()
            .find(|(id, device)| !bound.contains(id) && device.available_memory() >= bytes)
            .map(|(id, _)| *id)
    }

    fn load(
        &self,
        task: &str,
        device: DeviceId,
        function: &CompiledFunction,
        bundle: Arc<RuntimeBundle>,
        txn: &mut Transaction,
    ) -> Result<(), ProvisionError> {
        let manager: &Arc<dyn DeviceManager> = match self.devices.get(&device) {
            Some(manager) => manager,
            None => {
                return Err(ProvisionError::ResourceExhausted {
                    task: task.to_string(),
                    required: bundle.device_footprint(),
                })
            }
        };
        let loaded = CompiledFunction {
            artifact: Arc::clone(&function.artifact),
            bundle,
        };
        manager
            .load(task, loaded)
            .map_err(|source| ProvisionError::Load {
                task: task.to_string(),
                device,
                source,
            })?;
        txn.push(Undo::Loaded {
            device,
            task: task.to_string(),
        });
        Ok(())
    }

    fn rollback(
        &mut self,
        schedules: &mut [Schedule],
        txn: Transaction,
    ) {
        for undo in txn.into_reversed() {
            match undo {
                Undo::Reserved { device, bytes } => {
                    if let Some(manager) = self.devices.get(&device) {
                        manager.release(bytes);
                    }
                }
                Undo::Loaded { device, task } => {
                    if let Some(manager) = self.devices.get(&device) {
                        manager.evict(&task);
                    }
                }
                Undo::Bound { logical } => {
                    self.logical_bindings.remove(&logical);
                }
                Undo::Placed { task } => {
                    self.placements.shift_remove(&task);
                }
                Undo::Assigned {
                    schedule,
                    task,
                    device,
                } => {
                    if let Some(task) = schedules.get_mut(schedule).and_then(|s| s.task_mut(task)) {
                        task.unassign_device(device);
                    }
                }
                Undo::Attached { schedule, task } => {
                    if let Some(task) = schedules.get_mut(schedule).and_then(|s| s.task_mut(task)) {
                        task.detach_runtime_bundle();
                    }
                }
            }
        }
    }
}

/// Collect constants into `bundle` when the options ask for it.
fn prepare_bundle(
    task: &str,
    bundle: Arc<RuntimeBundle>,
    module: &Module,
    options: &CompileOptions,
) -> Result<Arc<RuntimeBundle>, ProvisionError> {
    if !options.collect_constants || !bundle.needs_constants() {
        return Ok(bundle);
    }
    let mut bundle = Arc::unwrap_or_clone(bundle);
    bundle
        .collect_constants(module)
        .map_err(|source| ProvisionError::Bundle {
            task: task.to_string(),
            source,
        })?;
    Ok(Arc::new(bundle))
}

/// Compare bundle placeholders with the sizes `declared` gives them.
///
/// Placeholders the module does not declare are left alone.
fn check_placeholders(
    task: &str,
    bundle: &RuntimeBundle,
    declared: &Module,
) -> Result<(), ProvisionError> {
    for (name, info) in bundle.placeholders() {
        if let Some(placeholder) = declared.placeholder(name) {
            if placeholder.size != info.size {
                return Err(ProvisionError::PlaceholderMismatch {
                    task: task.to_string(),
                    name: name.to_string(),
                    bundle: info.size,
                    module: placeholder.size,
                });
            }
        }
    }
    Ok(())
}
