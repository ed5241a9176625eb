//! Physical devices
//!
//! A [`DeviceManager`] owns the memory budget of one physical device and the
//! artifacts loaded onto it. The provisioner reserves and loads; the
//! dispatcher runs. [`HostDeviceManager`] executes artifacts on the host
//! through an [`Executor`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime::artifact::CompiledFunction;
use crate::runtime::context::ExecutionContext;
use crate::runtime::executor::{ExecutionError, Executor};

/// Physical device identifier.
pub type DeviceId = usize;

/// Devices by id, iterated in ascending id order.
pub type DeviceManagerMap = BTreeMap<DeviceId, Arc<dyn DeviceManager>>;

/// Default memory budget of a device: 2 GiB.
pub const DEFAULT_DEVICE_MEMORY: usize = 2 << 30;

fn default_memory_bytes() -> usize {
    DEFAULT_DEVICE_MEMORY
}

/// Static description of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,
    /// Memory budget in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: usize,
}

impl DeviceConfig {
    /// A device with the default budget.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_bytes: DEFAULT_DEVICE_MEMORY,
        }
    }

    /// Override the memory budget.
    pub fn with_memory(
        mut self,
        memory_bytes: usize,
    ) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }
}

/// Errors raised when loading onto a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// A task of this name is already loaded
    #[error("task `{0}` is already loaded")]
    AlreadyLoaded(String),
    /// The bundle declares constants but carries no constants region
    #[error("task `{0}` needs constants that were never collected")]
    ConstantsMissing(String),
}

/// Capabilities of one physical device.
pub trait DeviceManager: Send + Sync + fmt::Debug {
    /// Device id.
    fn id(&self) -> DeviceId;

    /// Display name.
    fn name(&self) -> &str;

    /// Total memory budget in bytes.
    fn capacity(&self) -> usize;

    /// Reserved bytes.
    fn used_memory(&self) -> usize;

    /// Unreserved bytes.
    fn available_memory(&self) -> usize {
        self.capacity().saturating_sub(self.used_memory())
    }

    /// Reserve `bytes`; returns `false` without reserving if they do not fit.
    fn reserve(
        &self,
        bytes: usize,
    ) -> bool;

    /// Return `bytes` previously reserved.
    fn release(
        &self,
        bytes: usize,
    );

    /// Load a compiled function under `task`.
    fn load(
        &self,
        task: &str,
        function: CompiledFunction,
    ) -> Result<(), DeviceError>;

    /// Unload `task`; returns whether it was loaded.
    fn evict(
        &self,
        task: &str,
    ) -> bool;

    /// Whether `task` is loaded.
    fn is_loaded(
        &self,
        task: &str,
    ) -> bool;

    /// Names of loaded tasks, in load order.
    fn loaded_tasks(&self) -> Vec<String>;

    /// Run the function loaded under `task` against `ctx`.
    fn run(
        &self,
        task: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError>;
}

#[derive(Debug, Default)]
struct Ledger {
    used: usize,
    loaded: IndexMap<String, CompiledFunction>,
}

/// Device backed by host memory.
#[derive(Debug)]
pub struct HostDeviceManager {
    id: DeviceId,
    name: String,
    capacity: usize,
    ledger: Mutex<Ledger>,
    executor: Executor,
}

impl HostDeviceManager {
    /// Create a device from its configuration.
    pub fn new(
        id: DeviceId,
        config: &DeviceConfig,
    ) -> Self {
        Self::with_executor(id, config, Executor::new())
    }

    /// Create a device running artifacts through `executor`.
    pub fn with_executor(
        id: DeviceId,
        config: &DeviceConfig,
        executor: Executor,
    ) -> Self {
        Self {
            id,
            name: config.name.clone(),
            capacity: config.memory_bytes,
            ledger: Mutex::new(Ledger::default()),
            executor,
        }
    }

    /// Executor used by [`run`](DeviceManager::run).
    #[inline]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl DeviceManager for HostDeviceManager {
    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn used_memory(&self) -> usize {
        self.ledger.lock().used
    }

    fn reserve(
        &self,
        bytes: usize,
    ) -> bool {
        let mut ledger = self.ledger.lock();
        match ledger.used.checked_add(bytes) {
            Some(used) if used <= self.capacity => {
                ledger.used = used;
                debug!(device = self.id, bytes, used, "reserved device memory");
                true
            }
            _ => false,
        }
    }

    fn release(
        &self,
        bytes: usize,
    ) {
        let mut ledger = self.ledger.lock();
        if bytes > ledger.used {
            warn!(
                device = self.id,
                bytes,
                used = ledger.used,
                "releasing more device memory than reserved"
            );
        }
        ledger.used = ledger.used.saturating_sub(bytes);
    }

    fn load(
        &self,
        task: &str,
        function: CompiledFunction,
    ) -> Result<(), DeviceError> {
        if function.bundle.needs_constants() {
            return Err(DeviceError::ConstantsMissing(task.to_string()));
        }
        let mut ledger = self.ledger.lock();
        if ledger.loaded.contains_key(task) {
            return Err(DeviceError::AlreadyLoaded(task.to_string()));
        }
        ledger.loaded.insert(task.to_string(), function);
        debug!(device = self.id, task, "loaded artifact");
        Ok(())
    }

    fn evict(
        &self,
        task: &str,
    ) -> bool {
        self.ledger.lock().loaded.shift_remove(task).is_some()
    }

    fn is_loaded(
        &self,
        task: &str,
    ) -> bool {
        self.ledger.lock().loaded.contains_key(task)
    }

    fn loaded_tasks(&self) -> Vec<String> {
        self.ledger.lock().loaded.keys().cloned().collect()
    }

    fn run(
        &self,
        task: &str,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        // Clone out so the ledger is not held while the artifact runs.
        let function = self
            .ledger
            .lock()
            .loaded
            .get(task)
            .cloned()
            .ok_or_else(|| ExecutionError::NotLoaded(task.to_string()))?;
        self.executor
            .execute(&function.artifact, &function.bundle, ctx)
    }
}

/// Build host devices from configurations; ids follow slice order.
pub fn host_devices(configs: &[DeviceConfig]) -> DeviceManagerMap {
    configs
        .iter()
        .enumerate()
        .map(|(id, config)| {
            let device: Arc<dyn DeviceManager> = Arc::new(HostDeviceManager::new(id, config));
            (id, device)
        })
        .collect()
}

#[cfg(test)]
mod tests;
