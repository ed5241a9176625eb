//! Schedule: the task DAG of one root function

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use super::task::{Task, TaskIndex};
use crate::runtime::device::DeviceId;
use crate::runtime::module::Module;

/// Errors found while walking a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// The edges form a cycle; `remaining` tasks could not be ordered
    #[error("schedule `{schedule}` contains a cycle through {remaining} tasks")]
    Cycle { schedule: String, remaining: usize },
}

/// Ordered, index-stable arena of tasks with parent/child edges.
///
/// Tasks are only appended; an index returned by [`add_task`](Self::add_task)
/// stays valid for the lifetime of the schedule.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Root function this schedule was partitioned from
    pub function_name: String,
    /// Stripped program metadata; placeholder sizes are checked against it
    /// at provision time
    pub module: Option<Arc<Module>>,
    tasks: Vec<Task>,
}

/// A complete program: one schedule per root function.
pub type DagList = Vec<Schedule>;

impl Schedule {
    /// Create an empty schedule.
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            module: None,
            tasks: Vec::new(),
        }
    }

    /// Attach program metadata.
    pub fn with_module(
        mut self,
        module: Arc<Module>,
    ) -> Self {
        self.module = Some(module);
        self
    }

    /// Append a task and return its index.
    ///
    /// Duplicate names are not detected.
    ///
    /// # Examples
    ///
    /// ```
    /// use nnrt::runtime::dag::Schedule;
    ///
    /// let mut schedule = Schedule::new("net");
    /// let a = schedule.add_task("function0", "CPU", [0]);
    /// let b = schedule.add_task("function1", "CPU", [1]);
    /// schedule.add_child(a, b);
    /// assert_eq!(schedule.roots(), vec![a]);
    /// assert_eq!(schedule.leaves(), vec![b]);
    /// ```
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        backend: impl Into<String>,
        logical_devices: impl IntoIterator<Item = DeviceId>,
    ) -> TaskIndex {
        self.tasks.push(Task::new(name, backend, logical_devices));
        self.tasks.len() - 1
    }

    /// Record `child` as depending on `parent`, on both ends.
    ///
    /// # Panics
    /// Panics if either index is out of range.
    pub fn add_child(
        &mut self,
        parent: TaskIndex,
        child: TaskIndex,
    ) {
        assert!(
            parent < self.tasks.len() && child < self.tasks.len(),
            "edge {} -> {} out of range for {} tasks",
            parent,
            child,
            self.tasks.len()
        );
        self.tasks[parent].push_child(child);
        self.tasks[child].push_parent(parent);
    }

    /// All tasks in insertion order.
    #[inline]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// All tasks, mutably.
    #[inline]
    pub fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    /// Number of tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the schedule has no tasks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task at `index`.
    #[inline]
    pub fn task(
        &self,
        index: TaskIndex,
    ) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Task at `index`, mutably.
    #[inline]
    pub fn task_mut(
        &mut self,
        index: TaskIndex,
    ) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    /// Index of the first task named `name`.
    pub fn find_task(
        &self,
        name: &str,
    ) -> Option<TaskIndex> {
        self.tasks.iter().position(|task| task.name == name)
    }

    /// Indices of tasks without parents.
    pub fn roots(&self) -> Vec<TaskIndex> {
        (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_root())
            .collect()
    }

    /// Indices of tasks without children.
    pub fn leaves(&self) -> Vec<TaskIndex> {
        (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_leaf())
            .collect()
    }

    /// Tasks ordered so that every parent precedes its children.
    pub fn topological_order(&self) -> Result<Vec<TaskIndex>, DagError> {
        let mut pending: Vec<usize> = self.tasks.iter().map(|t| t.parents().len()).collect();
        let mut ready: VecDeque<TaskIndex> = self.roots().into();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &child in self.tasks[index].children() {
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.push_back(child);
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(DagError::Cycle {
                schedule: self.function_name.clone(),
                remaining: self.tasks.len() - order.len(),
            });
        }
        Ok(order)
    }

    /// Whether every parent edge has a matching child edge and vice versa.
    pub fn edges_symmetric(&self) -> bool {
        let count = |edges: &[TaskIndex], target: TaskIndex| {
            edges.iter().filter(|&&e| e == target).count()
        };
        self.tasks.iter().enumerate().all(|(i, task)| {
            task.children().iter().all(|&child| {
                self.tasks
                    .get(child)
                    .is_some_and(|c| count(c.parents(), i) == count(task.children(), child))
            }) && task.parents().iter().all(|&parent| {
                self.tasks
                    .get(parent)
                    .is_some_and(|p| count(p.children(), i) == count(task.parents(), parent))
            })
        })
    }

    /// Whether every task has been placed on a device.
    pub fn is_provisioned(&self) -> bool {
        self.tasks.iter().all(Task::is_placed)
    }
}
