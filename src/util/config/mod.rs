//! nnrt configuration system
//!
//! A single TOML file describes the devices of a host, tracing, the
//! dispatcher, and optionally a program manifest.
//!
//! ```toml
//! [[devices]]
//! name = "CPU"
//! memory_bytes = 1073741824
//!
//! [trace]
//! level = "request|runtime"
//!
//! [dispatcher]
//! thread_name_prefix = "nnrt-device"
//!
//! [[schedules]]
//! name = "root0"
//!
//! [[schedules.tasks]]
//! name = "function0"
//! backend = "CPU"
//! logical_devices = [0, 1]
//! constant_bytes = 4096
//! placeholder_bytes = 1024
//! ```
//!
//! # Usage
//!
//! ```rust
//! use nnrt::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("[[devices]]\nname = \"CPU\"\n").unwrap();
//! assert_eq!(config.build_devices().len(), 1);
//! ```

mod manifest;

pub use manifest::{Program, ScheduleManifest, TaskManifest};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::backend::CompileOptions;
use crate::runtime::device::{host_devices, DeviceConfig, DeviceManagerMap};
use crate::runtime::scheduler::DispatcherConfig;
use crate::runtime::trace::{TraceContext, TraceLevel};

/// Runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Physical devices, in id order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Trace settings
    #[serde(default)]
    pub trace: TraceConfig,
    /// Dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Program manifest
    #[serde(default)]
    pub schedules: Vec<ScheduleManifest>,
}

/// Trace configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Accepted trace levels
    #[serde(default)]
    pub level: TraceLevel,
    /// Ask backends for instrumented artifacts
    #[serde(default)]
    pub instrument: bool,
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(index) = self.devices.iter().position(|d| d.memory_bytes == 0) {
            return Err(ConfigError::Invalid(format!(
                "device {} (`{}`) has no memory",
                index, self.devices[index].name
            )));
        }
        for schedule in &self.schedules {
            schedule.validate()?;
        }
        Ok(())
    }

    /// Host devices described by `[[devices]]`, ids following file order.
    pub fn build_devices(&self) -> DeviceManagerMap {
        host_devices(&self.devices)
    }

    /// Compile options matching the trace settings.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            instrument: self.trace.instrument,
            ..CompileOptions::default()
        }
    }

    /// A trace sink for one request, unless tracing is off.
    pub fn trace_context(&self) -> Option<TraceContext> {
        if self.trace.level.is_none() {
            return None;
        }
        Some(TraceContext::new(self.trace.level))
    }

    /// Build the program described by `[[schedules]]`.
    pub fn build_program(&self) -> Result<Program, ConfigError> {
        Program::from_manifests(&self.schedules)
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    RuntimeConfig::from_toml_str(&content)
}

/// Save configuration to a TOML file
pub fn save_config(
    config: &RuntimeConfig,
    path: impl AsRef<Path>,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let content = config.to_toml_string()?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests;
