//! Task: one partition of a schedule
//!
//! Represents a compiled unit placed on a single physical device.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::runtime::bundle::RuntimeBundle;
use crate::runtime::device::DeviceId;

/// Index of a task inside its schedule.
pub type TaskIndex = usize;

/// Candidate logical device slots of a task.
pub type LogicalDevices = SmallVec<[DeviceId; 4]>;

/// One partition of a schedule.
///
/// A task is owned by its [`Schedule`](super::Schedule) and addressed by its
/// index there; parents and children are indices into the same schedule.
#[derive(Debug, Clone)]
pub struct Task {
    /// Function name, matched against the module at provisioning time
    pub name: String,

    /// Backend kind tag
    pub backend: String,

    /// Ordered candidate logical device slots
    pub logical_devices: LogicalDevices,

    /// Physical devices, written only by the provisioner
    devices: SmallVec<[DeviceId; 2]>,

    /// Memory plan, attached at provisioning time if absent
    runtime_bundle: Option<Arc<RuntimeBundle>>,

    /// Tasks this task depends on
    parents: SmallVec<[TaskIndex; 4]>,

    /// Tasks depending on this task
    children: SmallVec<[TaskIndex; 4]>,
}

impl Task {
    /// Create an unplaced task.
    ///
    /// # Examples
    ///
    /// ```
    /// use nnrt::runtime::dag::Task;
    ///
    /// let task = Task::new("function0", "CPU", [0, 1]);
    /// assert_eq!(task.logical_devices.as_slice(), &[0, 1]);
    /// assert!(task.devices().is_empty());
    /// ```
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        logical_devices: impl IntoIterator<Item = DeviceId>,
    ) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            logical_devices: logical_devices.into_iter().collect(),
            devices: SmallVec::new(),
            runtime_bundle: None,
            parents: SmallVec::new(),
            children: SmallVec::new(),
        }
    }

    /// Physical devices assigned by the provisioner.
    #[inline]
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Whether the task has been placed.
    #[inline]
    pub fn is_placed(&self) -> bool {
        !self.devices.is_empty()
    }

    /// The attached memory plan.
    #[inline]
    pub fn runtime_bundle(&self) -> Option<&Arc<RuntimeBundle>> {
        self.runtime_bundle.as_ref()
    }

    /// Attach a memory plan unless one is already present.
    ///
    /// Returns whether `bundle` was attached.
    pub fn attach_runtime_bundle(
        &mut self,
        bundle: Arc<RuntimeBundle>,
    ) -> bool {
        if self.runtime_bundle.is_some() {
            return false;
        }
        self.runtime_bundle = Some(bundle);
        true
    }

    /// Tasks this task depends on.
    #[inline]
    pub fn parents(&self) -> &[TaskIndex] {
        &self.parents
    }

    /// Tasks depending on this task.
    #[inline]
    pub fn children(&self) -> &[TaskIndex] {
        &self.children
    }

    /// Check if this task is a root (no parents).
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check if this task is a leaf (no children).
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[inline]
    pub(crate) fn detach_runtime_bundle(&mut self) {
        self.runtime_bundle = None;
    }

    #[inline]
    pub(crate) fn assign_device(
        &mut self,
        device: DeviceId,
    ) {
        self.devices.push(device);
    }

    /// Drop `device` from the assigned devices.
    pub(crate) fn unassign_device(
        &mut self,
        device: DeviceId,
    ) {
        self.devices.retain(|&mut d| d != device);
    }

    #[inline]
    pub(crate) fn clear_devices(&mut self) {
        self.devices.clear();
    }

    #[inline]
    pub(super) fn push_parent(
        &mut self,
        parent: TaskIndex,
    ) {
        self.parents.push(parent);
    }

    #[inline]
    pub(super) fn push_child(
        &mut self,
        child: TaskIndex,
    ) {
        self.children.push(child);
    }
}

impl fmt::Display for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({} on {}", self.name, self.backend)?;
        match self.devices.first() {
            Some(device) => write!(f, ", device {})", device),
            None => write!(f, ", unplaced)"),
        }
    }
}
