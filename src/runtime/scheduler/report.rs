//! Per-request task states.

use std::fmt;

use crate::runtime::dag::TaskIndex;
use crate::runtime::device::DeviceId;

/// State of one task within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for parents.
    Waiting,
    /// Queued on or running on its device.
    Running,
    /// Completed successfully.
    Finished,
    /// Failed or panicked.
    Failed,
    /// Never launched because another task failed.
    Cancelled,
}

impl TaskState {
    /// Whether the task will not change state again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Task name
    pub name: String,
    /// Device the task was dispatched to
    pub device: Option<DeviceId>,
    /// Final state
    pub state: TaskState,
    /// Time spent on the device, in microseconds
    pub elapsed_us: Option<u64>,
}

/// Outcome of every task of one request, indexed like the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Schedule that was run
    pub schedule: String,
    tasks: Vec<TaskRecord>,
}

impl RunReport {
    pub(super) fn new(
        schedule: impl Into<String>,
        tasks: Vec<TaskRecord>,
    ) -> Self {
        Self {
            schedule: schedule.into(),
            tasks,
        }
    }

    /// Records in schedule order.
    #[inline]
    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    /// Record of the task at `index`.
    #[inline]
    pub fn task(
        &self,
        index: TaskIndex,
    ) -> Option<&TaskRecord> {
        self.tasks.get(index)
    }

    /// State of the first task named `name`.
    pub fn state_of(
        &self,
        name: &str,
    ) -> Option<TaskState> {
        self.tasks
            .iter()
            .find(|record| record.name == name)
            .map(|record| record.state)
    }

    /// Number of tasks in `state`.
    pub fn count(
        &self,
        state: TaskState,
    ) -> usize {
        self.tasks.iter().filter(|record| record.state == state).count()
    }

    /// Whether every task finished.
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|record| record.state == TaskState::Finished)
    }
}
