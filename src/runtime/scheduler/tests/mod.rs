//! Dispatcher 单元测试
//!
//! 测试依赖顺序、失败取消、统计信息与请求级跟踪

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::artifact::{CompiledArtifact, CompiledFunction, InvocationError};
use crate::runtime::bundle::RuntimeBundleBuilder;
use crate::runtime::context::{ExecutionContext, PlaceholderBindings, Tensor};
use crate::runtime::dag::Schedule;
use crate::runtime::device::{host_devices, DeviceConfig, DeviceManager, DeviceManagerMap};
use crate::runtime::executor::ExecutionError;
use crate::runtime::scheduler::{DispatchError, Dispatcher, DispatcherConfig, TaskState};
use crate::runtime::trace::{TraceContext, TraceLevel};

type Log = Arc<Mutex<Vec<String>>>;

fn devices(count: usize) -> DeviceManagerMap {
    let configs: Vec<DeviceConfig> = (0..count)
        .map(|i| DeviceConfig::new(format!("host{}", i)).with_memory(1 << 20))
        .collect();
    host_devices(&configs)
}

fn empty_bundle() -> crate::runtime::bundle::RuntimeBundle {
    RuntimeBundleBuilder::new().build().unwrap()
}

/// Function appending its name to `log` when run.
fn recording(
    name: &str,
    log: &Log,
) -> CompiledFunction {
    let log = Arc::clone(log);
    let entry_name = name.to_string();
    CompiledFunction::new(
        CompiledArtifact::new(name).with_entry(move |_| {
            log.lock().push(entry_name.clone());
            Ok(())
        }),
        empty_bundle(),
    )
}

fn failing(name: &str) -> CompiledFunction {
    CompiledFunction::new(
        CompiledArtifact::new(name).with_entry(|_| Err(InvocationError::new("device fault"))),
        empty_bundle(),
    )
}

/// Add a task, load `function` for it on `device` and place it there.
fn add(
    schedule: &mut Schedule,
    devices: &DeviceManagerMap,
    name: &str,
    device: usize,
    function: CompiledFunction,
) -> usize {
    let index = schedule.add_task(name, "Host", [device]);
    devices[&device].load(name, function).unwrap();
    schedule.task_mut(index).unwrap().assign_device(device);
    index
}

fn request() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext::default())
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    #[test]
    fn test_chain_runs_in_order() {
        let devices = devices(2);
        let log = Log::default();
        let mut schedule = Schedule::new("chain");
        let a = add(&mut schedule, &devices, "a", 0, recording("a", &log));
        let b = add(&mut schedule, &devices, "b", 1, recording("b", &log));
        let c = add(&mut schedule, &devices, "c", 0, recording("c", &log));
        schedule.add_child(a, b);
        schedule.add_child(b, c);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let report = dispatcher.run(&schedule, request()).unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(report.is_success());
        assert_eq!(report.task(b).unwrap().device, Some(1));
        assert!(report.tasks().iter().all(|r| r.elapsed_us.is_some()));
    }

    #[test]
    fn test_diamond_join_waits_for_both_parents() {
        let devices = devices(3);
        let log = Log::default();
        let mut schedule = Schedule::new("diamond");
        let a = add(&mut schedule, &devices, "a", 0, recording("a", &log));
        let b = add(&mut schedule, &devices, "b", 1, recording("b", &log));
        let c = add(&mut schedule, &devices, "c", 2, recording("c", &log));
        let d = add(&mut schedule, &devices, "d", 0, recording("d", &log));
        schedule.add_child(a, b);
        schedule.add_child(a, c);
        schedule.add_child(b, d);
        schedule.add_child(c, d);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        dispatcher.run(&schedule, request()).unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "a");
        assert_eq!(log[3], "d");
    }

    #[test]
    fn test_outputs_flow_between_tasks() {
        let devices = devices(2);
        let first = RuntimeBundleBuilder::new()
            .placeholder("X", 4)
            .placeholder("Y", 4)
            .build()
            .unwrap();
        let y_offset = first.symbol("Y").unwrap().offset;
        let double = CompiledArtifact::new("double").with_entry(move |buffers| {
            for i in 0..4 {
                buffers.mutable_weights[y_offset + i] = buffers.mutable_weights[i] * 2;
            }
            Ok(())
        });
        let second = RuntimeBundleBuilder::new()
            .placeholder("Y", 4)
            .placeholder("Z", 4)
            .build()
            .unwrap();
        let z_offset = second.symbol("Z").unwrap().offset;
        let increment = CompiledArtifact::new("increment").with_entry(move |buffers| {
            for i in 0..4 {
                buffers.mutable_weights[z_offset + i] = buffers.mutable_weights[i] + 1;
            }
            Ok(())
        });

        let mut schedule = Schedule::new("pipeline");
        let a = add(&mut schedule, &devices, "double", 0, CompiledFunction::new(double, first));
        let b = add(&mut schedule, &devices, "increment", 1, CompiledFunction::new(increment, second));
        schedule.add_child(a, b);

        let bindings = PlaceholderBindings::new()
            .with("X", Tensor::from_bytes(vec![1, 2, 3, 4]))
            .with("Y", Tensor::zeroed(4))
            .with("Z", Tensor::zeroed(4));
        let ctx = Arc::new(ExecutionContext::new(bindings));

        let dispatcher = Dispatcher::new(&devices).unwrap();
        dispatcher.run(&schedule, Arc::clone(&ctx)).unwrap();

        assert_eq!(ctx.bindings().get("Z").unwrap().as_bytes(), &[3, 5, 7, 9]);
    }

    #[test]
    fn test_devices_run_in_parallel() {
        let devices = devices(2);
        let barrier = Arc::new(Barrier::new(2));
        let mut schedule = Schedule::new("wide");
        for (name, device) in [("left", 0), ("right", 1)] {
            let barrier = Arc::clone(&barrier);
            let artifact = CompiledArtifact::new(name).with_entry(move |_| {
                barrier.wait();
                Ok(())
            });
            add(&mut schedule, &devices, name, device, CompiledFunction::new(artifact, empty_bundle()));
        }

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let report = dispatcher.run(&schedule, request()).unwrap();
        assert!(report.is_success());
        assert_eq!(
            dispatcher
                .stats()
                .peak_parallelism
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[test]
    fn test_worker_thread_names() {
        let devices = devices(2);
        let seen = Log::default();
        let recorder = Arc::clone(&seen);
        let artifact = CompiledArtifact::new("named").with_entry(move |_| {
            let name = thread::current().name().unwrap_or_default().to_string();
            recorder.lock().push(name);
            Ok(())
        });
        let mut schedule = Schedule::new("named");
        add(&mut schedule, &devices, "named", 1, CompiledFunction::new(artifact, empty_bundle()));

        let config = DispatcherConfig {
            thread_name_prefix: "accel".to_string(),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::with_config(&devices, config).unwrap();
        dispatcher.run(&schedule, request()).unwrap();
        assert_eq!(*seen.lock(), vec!["accel-1"]);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[test]
    fn test_failure_cancels_descendants() {
        let devices = devices(2);
        let log = Log::default();
        let mut schedule = Schedule::new("broken");
        let a = add(&mut schedule, &devices, "a", 0, failing("a"));
        let b = add(&mut schedule, &devices, "b", 1, recording("b", &log));
        let c = add(&mut schedule, &devices, "c", 0, recording("c", &log));
        schedule.add_child(a, b);
        schedule.add_child(b, c);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();

        match &err {
            DispatchError::TaskFailed { task, source, report } => {
                assert_eq!(task, "a");
                assert!(matches!(source, ExecutionError::Invocation { .. }));
                assert_eq!(report.state_of("a"), Some(TaskState::Failed));
                assert_eq!(report.state_of("b"), Some(TaskState::Cancelled));
                assert_eq!(report.state_of("c"), Some(TaskState::Cancelled));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.report().is_some());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_in_flight_task_drains() {
        let devices = devices(2);
        let log = Log::default();
        let slow_log = Arc::clone(&log);
        let slow = CompiledArtifact::new("slow").with_entry(move |_| {
            thread::sleep(Duration::from_millis(50));
            slow_log.lock().push("slow".to_string());
            Ok(())
        });
        let mut schedule = Schedule::new("mixed");
        let s = add(&mut schedule, &devices, "slow", 0, CompiledFunction::new(slow, empty_bundle()));
        add(&mut schedule, &devices, "bad", 1, failing("bad"));
        let after = add(&mut schedule, &devices, "after", 0, recording("after", &log));
        schedule.add_child(s, after);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();
        let report = err.report().unwrap();

        assert_eq!(report.state_of("slow"), Some(TaskState::Finished));
        assert_eq!(report.state_of("bad"), Some(TaskState::Failed));
        assert_eq!(report.state_of("after"), Some(TaskState::Cancelled));
        assert_eq!(*log.lock(), vec!["slow"]);
    }

    #[test]
    fn test_panic_is_reported() {
        let devices = devices(1);
        let artifact = CompiledArtifact::new("boom").with_entry(|_| panic!("boom"));
        let mut schedule = Schedule::new("panics");
        add(&mut schedule, &devices, "boom", 0, CompiledFunction::new(artifact, empty_bundle()));

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::TaskPanicked { ref task, ref message, .. } if task == "boom" && message == "boom"
        ));

        // The worker survives the panic.
        let log = Log::default();
        let mut next = Schedule::new("next");
        add(&mut next, &devices, "ok", 0, recording("ok", &log));
        dispatcher.run(&next, request()).unwrap();
        assert_eq!(*log.lock(), vec!["ok"]);
    }

    #[test]
    fn test_unplaced_task_rejected() {
        let devices = devices(1);
        let mut schedule = Schedule::new("raw");
        schedule.add_task("a", "Host", [0]);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();
        assert!(matches!(err, DispatchError::NotProvisioned(ref task) if task == "a"));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let devices = devices(1);
        let mut schedule = Schedule::new("far");
        let index = schedule.add_task("a", "Host", [0]);
        schedule.task_mut(index).unwrap().assign_device(7);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDevice { device: 7, .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let devices = devices(1);
        let log = Log::default();
        let mut schedule = Schedule::new("cycle");
        let a = add(&mut schedule, &devices, "a", 0, recording("a", &log));
        let b = add(&mut schedule, &devices, "b", 0, recording("b", &log));
        schedule.add_child(a, b);
        schedule.add_child(b, a);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        let err = dispatcher.run(&schedule, request()).unwrap_err();
        assert!(matches!(err, DispatchError::Dag(_)));
        assert!(log.lock().is_empty());
    }
}

#[cfg(test)]
mod stats_tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_stats_accumulate() {
        let devices = devices(2);
        let log = Log::default();
        let mut ok = Schedule::new("ok");
        let a = add(&mut ok, &devices, "a", 0, recording("a", &log));
        let b = add(&mut ok, &devices, "b", 1, recording("b", &log));
        ok.add_child(a, b);

        let mut bad = Schedule::new("bad");
        let x = add(&mut bad, &devices, "x", 0, failing("x"));
        let y = add(&mut bad, &devices, "y", 1, recording("y", &log));
        bad.add_child(x, y);

        let dispatcher = Dispatcher::new(&devices).unwrap();
        dispatcher.run(&ok, request()).unwrap();
        dispatcher.run(&bad, request()).unwrap_err();

        let stats = dispatcher.stats();
        assert_eq!(stats.tasks_scheduled.load(Ordering::SeqCst), 3);
        assert_eq!(stats.tasks_completed.load(Ordering::SeqCst), 2);
        assert_eq!(stats.tasks_failed.load(Ordering::SeqCst), 1);
        assert_eq!(stats.tasks_cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(stats.peak_parallelism.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_trace_events() {
        let devices = devices(2);
        let log = Log::default();
        let mut schedule = Schedule::new("traced");
        let a = add(&mut schedule, &devices, "a", 0, recording("a", &log));
        let b = add(&mut schedule, &devices, "b", 1, recording("b", &log));
        schedule.add_child(a, b);

        let ctx = Arc::new(ExecutionContext::with_trace(
            PlaceholderBindings::new(),
            TraceContext::new(TraceLevel::REQUEST),
        ));
        let dispatcher = Dispatcher::new(&devices).unwrap();
        dispatcher.run(&schedule, Arc::clone(&ctx)).unwrap();

        let events = ctx.trace().unwrap().events();
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(events[1].tid, 1);
        assert!(events.iter().all(|e| e.duration.is_some()));
    }

    #[test]
    fn test_shutdown() {
        let devices = devices(3);
        let mut dispatcher = Dispatcher::new(&devices).unwrap();
        assert!(dispatcher.is_running());
        assert_eq!(dispatcher.num_workers(), 3);
        dispatcher.shutdown();
        assert!(!dispatcher.is_running());
    }
}
