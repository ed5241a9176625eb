//! DAG 模块单元测试
//!
//! 测试任务图的构建、遍历与边的一致性

use std::sync::Arc;

use crate::runtime::bundle::RuntimeBundleBuilder;
use crate::runtime::dag::{DagError, Schedule, Task};

/// a -> b, a -> c, b -> d, c -> d
fn diamond() -> Schedule {
    let mut schedule = Schedule::new("diamond");
    let a = schedule.add_task("a", "CPU", [0]);
    let b = schedule.add_task("b", "CPU", [1]);
    let c = schedule.add_task("c", "CPU", [2]);
    let d = schedule.add_task("d", "CPU", [0]);
    schedule.add_child(a, b);
    schedule.add_child(a, c);
    schedule.add_child(b, d);
    schedule.add_child(c, d);
    schedule
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new("function0", "CPU", [0, 1]);
        assert_eq!(task.name, "function0");
        assert_eq!(task.backend, "CPU");
        assert_eq!(task.logical_devices.as_slice(), &[0, 1]);
        assert!(task.devices().is_empty());
        assert!(task.runtime_bundle().is_none());
        assert!(task.is_root() && task.is_leaf());
    }

    #[test]
    fn test_task_devices() {
        let mut task = Task::new("f", "CPU", [0]);
        assert!(!task.is_placed());
        task.assign_device(3);
        assert_eq!(task.devices(), &[3]);
        assert!(task.is_placed());
        task.clear_devices();
        assert!(!task.is_placed());
    }

    #[test]
    fn test_bundle_attached_once() {
        let mut task = Task::new("f", "CPU", [0]);
        let first = Arc::new(RuntimeBundleBuilder::new().placeholder("X", 4).build().unwrap());
        let second = Arc::new(RuntimeBundleBuilder::new().placeholder("Y", 8).build().unwrap());
        assert!(task.attach_runtime_bundle(first));
        assert!(!task.attach_runtime_bundle(second));
        assert!(task.runtime_bundle().unwrap().symbol("X").is_some());
    }

    #[test]
    fn test_task_display() {
        let mut task = Task::new("f", "CPU", [0]);
        assert_eq!(task.to_string(), "Task(f on CPU, unplaced)");
        task.assign_device(2);
        assert_eq!(task.to_string(), "Task(f on CPU, device 2)");
    }
}

#[cfg(test)]
mod schedule_tests {
    use super::*;

    #[test]
    fn test_add_task_indices() {
        let mut schedule = Schedule::new("net");
        assert!(schedule.is_empty());
        assert_eq!(schedule.add_task("function0", "CPU", [0, 1]), 0);
        assert_eq!(schedule.add_task("function1", "CPU", [0, 1]), 1);
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.task(1).unwrap().name, "function1");
        assert!(schedule.task(2).is_none());
    }

    #[test]
    fn test_duplicate_names_allowed() {
        let mut schedule = Schedule::new("net");
        schedule.add_task("f", "CPU", [0]);
        schedule.add_task("f", "CPU", [0]);
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.find_task("f"), Some(0));
        assert_eq!(schedule.find_task("g"), None);
    }

    #[test]
    fn test_add_child_both_ends() {
        let schedule = diamond();
        assert_eq!(schedule.task(0).unwrap().children(), &[1, 2]);
        assert_eq!(schedule.task(3).unwrap().parents(), &[1, 2]);
        assert!(schedule.edges_symmetric());
    }

    #[test]
    #[should_panic]
    fn test_add_child_out_of_range() {
        let mut schedule = Schedule::new("net");
        let a = schedule.add_task("a", "CPU", [0]);
        schedule.add_child(a, 5);
    }

    #[test]
    fn test_roots_and_leaves() {
        let schedule = diamond();
        assert_eq!(schedule.roots(), vec![0]);
        assert_eq!(schedule.leaves(), vec![3]);
    }

    #[test]
    fn test_topological_order() {
        let schedule = diamond();
        let order = schedule.topological_order().unwrap();
        assert_eq!(order.len(), 4);
        let position = |i: usize| order.iter().position(|&x| x == i).unwrap();
        for (index, task) in schedule.tasks().iter().enumerate() {
            for &child in task.children() {
                assert!(position(index) < position(child));
            }
        }
    }

    #[test]
    fn test_cycle_detected() {
        let mut schedule = Schedule::new("loop");
        let a = schedule.add_task("a", "CPU", [0]);
        let b = schedule.add_task("b", "CPU", [0]);
        let c = schedule.add_task("c", "CPU", [0]);
        schedule.add_child(a, b);
        schedule.add_child(b, c);
        schedule.add_child(c, b);
        assert_eq!(
            schedule.topological_order().unwrap_err(),
            DagError::Cycle {
                schedule: "loop".to_string(),
                remaining: 2
            }
        );
    }

    #[test]
    fn test_is_provisioned() {
        let mut schedule = diamond();
        assert!(!schedule.is_provisioned());
        for task in schedule.tasks_mut() {
            task.assign_device(0);
        }
        assert!(schedule.is_provisioned());
    }

    #[test]
    fn test_clone_is_deep() {
        let original = diamond();
        let mut copy = original.clone();
        copy.task_mut(0).unwrap().assign_device(1);
        assert!(!original.task(0).unwrap().is_placed());
        assert!(copy.task(0).unwrap().is_placed());
    }
}
