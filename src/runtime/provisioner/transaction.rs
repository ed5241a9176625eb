//! Undo log of one provisioning call

use crate::runtime::dag::TaskIndex;
use crate::runtime::device::DeviceId;

/// One state change, described by how to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Undo {
    /// Bytes reserved on a device
    Reserved { device: DeviceId, bytes: usize },
    /// Artifact loaded on a device
    Loaded { device: DeviceId, task: String },
    /// Logical id newly bound
    Bound { logical: DeviceId },
    /// Placement recorded under a task name
    Placed { task: String },
    /// Device written into a task
    Assigned {
        schedule: usize,
        task: TaskIndex,
        device: DeviceId,
    },
    /// Runtime bundle attached to a task
    Attached { schedule: usize, task: TaskIndex },
}

/// Changes made so far, oldest first.
#[derive(Debug, Default)]
pub(super) struct Transaction {
    log: Vec<Undo>,
}

impl Transaction {
    #[inline]
    pub(super) fn push(
        &mut self,
        undo: Undo,
    ) {
        self.log.push(undo);
    }

    #[inline]
    pub(super) fn len(&self) -> usize {
        self.log.len()
    }

    /// Changes newest first, the order they must be undone in.
    pub(super) fn into_reversed(self) -> impl Iterator<Item = Undo> {
        self.log.into_iter().rev()
    }
}
