//! Device 单元测试
//!
//! 测试内存预算、加载/卸载与主机执行

use crate::runtime::artifact::{CompiledArtifact, CompiledFunction};
use crate::runtime::bundle::RuntimeBundleBuilder;
use crate::runtime::context::{ExecutionContext, PlaceholderBindings, Tensor};
use crate::runtime::device::{
    host_devices, DeviceConfig, DeviceError, DeviceManager, HostDeviceManager,
    DEFAULT_DEVICE_MEMORY,
};
use crate::runtime::executor::ExecutionError;

fn device(memory: usize) -> HostDeviceManager {
    HostDeviceManager::new(0, &DeviceConfig::new("host0").with_memory(memory))
}

fn filler() -> CompiledFunction {
    CompiledFunction::new(
        CompiledArtifact::new("fill").with_entry(|buffers| {
            buffers.mutable_weights.fill(0xAB);
            Ok(())
        }),
        RuntimeBundleBuilder::new().placeholder("X", 16).build().unwrap(),
    )
}

#[cfg(test)]
mod budget_tests {
    use super::*;

    #[test]
    fn test_reserve_within_capacity() {
        let device = device(1000);
        assert!(device.reserve(600));
        assert!(device.reserve(400));
        assert_eq!(device.used_memory(), 1000);
        assert_eq!(device.available_memory(), 0);
        assert!(!device.reserve(1));
        assert_eq!(device.used_memory(), 1000);
    }

    #[test]
    fn test_refused_reservation_changes_nothing() {
        let device = device(1000);
        assert!(!device.reserve(1001));
        assert_eq!(device.used_memory(), 0);
        assert!(!device.reserve(usize::MAX));
        assert_eq!(device.available_memory(), 1000);
    }

    #[test]
    fn test_release() {
        let device = device(1000);
        assert!(device.reserve(700));
        device.release(300);
        assert_eq!(device.used_memory(), 400);
        device.release(1000);
        assert_eq!(device.used_memory(), 0);
    }

    #[test]
    fn test_default_budget() {
        let config: DeviceConfig = serde_json::from_str(r#"{"name": "cpu"}"#).unwrap();
        assert_eq!(config.memory_bytes, DEFAULT_DEVICE_MEMORY);
    }

    #[test]
    fn test_host_devices_ids() {
        let devices = host_devices(&[
            DeviceConfig::new("a").with_memory(10),
            DeviceConfig::new("b").with_memory(20),
        ]);
        let summary: Vec<(usize, String, usize)> = devices
            .values()
            .map(|d| (d.id(), d.name().to_string(), d.capacity()))
            .collect();
        assert_eq!(
            summary,
            vec![(0, "a".to_string(), 10), (1, "b".to_string(), 20)]
        );
    }
}

#[cfg(test)]
mod load_tests {
    use super::*;
    use crate::runtime::module::Module;

    #[test]
    fn test_load_and_evict() {
        let device = device(1000);
        device.load("task0", filler()).unwrap();
        assert!(device.is_loaded("task0"));
        assert_eq!(
            device.load("task0", filler()).unwrap_err(),
            DeviceError::AlreadyLoaded("task0".to_string())
        );
        device.load("task1", filler()).unwrap();
        assert_eq!(device.loaded_tasks(), vec!["task0", "task1"]);

        assert!(device.evict("task0"));
        assert!(!device.evict("task0"));
        assert_eq!(device.loaded_tasks(), vec!["task1"]);
    }

    #[test]
    fn test_load_requires_collected_constants() {
        let device = device(1000);
        let bundle = RuntimeBundleBuilder::new().constant("W", 8).build().unwrap();
        let function = CompiledFunction::new(CompiledArtifact::noop("w"), bundle.clone());
        assert_eq!(
            device.load("w", function).unwrap_err(),
            DeviceError::ConstantsMissing("w".to_string())
        );

        let mut module = Module::new();
        module.add_constant("W", vec![1u8; 8]);
        let mut bundle = bundle;
        bundle.collect_constants(&module).unwrap();
        device
            .load("w", CompiledFunction::new(CompiledArtifact::noop("w"), bundle))
            .unwrap();
    }

    #[test]
    fn test_run_loaded_task() {
        let device = device(1000);
        device.load("task0", filler()).unwrap();
        let ctx = ExecutionContext::new(PlaceholderBindings::new().with("X", Tensor::zeroed(16)));

        device.run("task0", &ctx).unwrap();
        assert_eq!(ctx.into_bindings().get("X").unwrap(), &Tensor::filled(16, 0xAB));
    }

    #[test]
    fn test_run_unknown_task() {
        let device = device(1000);
        let ctx = ExecutionContext::default();
        assert_eq!(
            device.run("missing", &ctx).unwrap_err(),
            ExecutionError::NotLoaded("missing".to_string())
        );
    }
}
