//! Config 单元测试
//!
//! 测试 TOML 解析、校验、文件读写与清单构建

use std::io::Write;

use crate::runtime::backend::{Backend, CompileOptions};
use crate::runtime::device::{DeviceManager, DEFAULT_DEVICE_MEMORY};
use crate::runtime::provisioner::Provisioner;
use crate::runtime::trace::{TraceEventKind, TraceLevel};
use crate::util::config::{load_config, save_config, ConfigError, RuntimeConfig};

const SAMPLE: &str = r#"
[[devices]]
name = "CPU"
memory_bytes = 1000000

[[devices]]
name = "CPU"

[trace]
level = "request|runtime"

[dispatcher]
thread_name_prefix = "worker"

[[schedules]]
name = "root0"

[[schedules.tasks]]
name = "function0"
logical_devices = [0, 1]
constant_bytes = 4096
placeholder_bytes = 1024
children = ["function1"]

[[schedules.tasks]]
name = "function1"
placeholder_bytes = 512
activation_bytes = 256

[[schedules]]
name = "root1"

[[schedules.tasks]]
name = "function2"
backend = "Accel"
logical_devices = [1]
"#;

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn test_parse_sample() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].memory_bytes, 1_000_000);
        assert_eq!(config.devices[1].memory_bytes, DEFAULT_DEVICE_MEMORY);
        assert_eq!(config.trace.level, TraceLevel::REQUEST.union(TraceLevel::RUNTIME));
        assert_eq!(config.dispatcher.thread_name_prefix, "worker");
        assert_eq!(config.dispatcher.queue_capacity, None);
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].tasks[1].backend, "CPU");
        assert_eq!(config.schedules[0].tasks[1].logical_devices, vec![0]);
    }

    #[test]
    fn test_empty_config() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.trace_context().is_none());
        assert_eq!(config.dispatcher.thread_name_prefix, "nnrt-device");
    }

    #[test]
    fn test_bad_trace_level() {
        let err = RuntimeConfig::from_toml_str("[trace]\nlevel = \"verbose\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_memory_rejected() {
        let err = RuntimeConfig::from_toml_str("[[devices]]\nname = \"CPU\"\nmemory_bytes = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_child_rejected() {
        let content = r#"
[[schedules]]
name = "root0"

[[schedules.tasks]]
name = "a"
children = ["b"]
"#;
        let err = RuntimeConfig::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("unknown child `b`"));
    }

    #[test]
    fn test_trace_and_compile_options() {
        let config = RuntimeConfig::from_toml_str("[trace]\nlevel = \"standard\"\ninstrument = true\n")
            .unwrap();
        assert_eq!(config.trace_context().unwrap().level(), TraceLevel::STANDARD);
        assert!(config.compile_options().instrument);
        assert!(config.compile_options().collect_constants);
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.build_devices().len(), 2);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nnrt.toml");
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();

        save_config(&config, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

#[cfg(test)]
mod manifest_tests {
    use super::*;

    #[test]
    fn test_build_program() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let program = config.build_program().unwrap();

        assert_eq!(program.schedules.len(), 2);
        let root0 = &program.schedules[0];
        assert_eq!(root0.function_name, "root0");
        assert_eq!(root0.task(0).unwrap().children(), &[1]);
        assert!(root0.edges_symmetric());
        assert!(program.module.has_function("function2"));
        assert_eq!(program.module.constant("function0.weights").unwrap().len(), 4096);
        assert_eq!(program.backends.kinds(), vec!["Accel", "CPU"]);
    }

    #[test]
    fn test_plan_manifest() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let mut program = config.build_program().unwrap();
        let mut provisioner = Provisioner::new(config.build_devices(), program.backends);

        provisioner
            .provision(&mut program.schedules, &program.module, &CompileOptions::default())
            .unwrap();

        assert!(program.schedules.iter().all(|s| s.is_provisioned()));
        // function0 and function1 bind logical 0 to device 0; function2 binds logical 1 to device 1.
        assert_eq!(provisioner.devices()[&0].used_memory(), 4096 + 1024 + 512);
        assert_eq!(provisioner.devices()[&1].used_memory(), 0);
    }

    #[test]
    fn test_schedules_share_stripped_module() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let program = config.build_program().unwrap();

        let module = program.schedules[1].module.as_ref().unwrap();
        assert!(module.has_function("function0"));
        assert_eq!(module.placeholder("function1.io").unwrap().size, 512);
        assert_eq!(module.placeholder("function1.trace").unwrap().size, 16);
        assert_eq!(module.num_constants(), 0);
        assert_eq!(program.module.num_constants(), 1);
    }

    #[test]
    fn test_instrumented_variant() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        let program = config.build_program().unwrap();
        let backend = program.backends.get("CPU").unwrap();
        let instrument = CompileOptions {
            instrument: true,
            ..CompileOptions::default()
        };

        let plain = backend
            .compile("function1", &program.module, &CompileOptions::default())
            .unwrap();
        assert!(!plain.artifact.trace_info().enabled);
        assert!(plain.bundle.symbol("function1.trace").is_none());

        let compiled = backend.compile("function1", &program.module, &instrument).unwrap();
        let info = compiled.artifact.trace_info();
        assert!(info.enabled);
        assert_eq!(info.backing_size("function1.trace"), 16);
        let events = &info.events["function1.trace"];
        assert_eq!(events[0].name, "function1");
        assert_eq!(events[0].kind, TraceEventKind::Complete);
        let symbol = compiled.bundle.symbol("function1.trace").unwrap();
        assert_eq!(symbol.size, 16);
        assert_eq!(compiled.bundle.device_footprint(), symbol.offset + 16);
    }
}
