//! Compilation backends
//!
//! A [`Backend`] turns one function of a [`Module`] into a
//! [`CompiledFunction`]. The provisioner resolves a task's backend kind
//! through a [`BackendRegistry`] owned by the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::runtime::artifact::CompiledFunction;
use crate::runtime::module::Module;

/// Options forwarded to backends at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Ask backends to emit trace instrumentation
    pub instrument: bool,
    /// Copy constant payloads from the module into each bundle after compiling
    pub collect_constants: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            instrument: false,
            collect_constants: true,
        }
    }
}

/// Errors reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend has nothing for this function
    #[error("backend `{backend}` cannot compile function `{function}`")]
    FunctionNotFound { backend: String, function: String },
    /// Any other backend failure
    #[error("{0}")]
    Other(String),
}

/// Compilation entry point for one backend kind.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Kind tag matched against `Task::backend`.
    fn kind(&self) -> &str;

    /// Compile `function` of `module`.
    fn compile(
        &self,
        function: &str,
        module: &Module,
        options: &CompileOptions,
    ) -> Result<CompiledFunction, BackendError>;
}

/// Backends by kind tag.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its kind, replacing any previous one.
    pub fn register(
        &mut self,
        backend: Arc<dyn Backend>,
    ) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.kind().to_string(), backend)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(
        mut self,
        backend: Arc<dyn Backend>,
    ) -> Self {
        self.register(backend);
        self
    }

    /// Look up a backend.
    pub fn get(
        &self,
        kind: &str,
    ) -> Option<&Arc<dyn Backend>> {
        self.backends.get(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Backend serving functions compiled ahead of time.
///
/// Functions are registered by name; `compile` hands out the registered
/// artifact and bundle. A function may also carry an instrumented variant,
/// served instead when [`CompileOptions::instrument`] is set.
#[derive(Debug)]
pub struct StaticBackend {
    kind: String,
    functions: RwLock<HashMap<String, CompiledFunction>>,
    instrumented: RwLock<HashMap<String, CompiledFunction>>,
    compile_count: AtomicUsize,
}

impl StaticBackend {
    /// Create an empty backend of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            functions: RwLock::new(HashMap::new()),
            instrumented: RwLock::new(HashMap::new()),
            compile_count: AtomicUsize::new(0),
        }
    }

    /// Register the compiled form of `function`.
    pub fn register(
        &self,
        function: impl Into<String>,
        compiled: CompiledFunction,
    ) {
        self.functions.write().insert(function.into(), compiled);
    }

    /// Register the instrumented form of `function`.
    pub fn register_instrumented(
        &self,
        function: impl Into<String>,
        compiled: CompiledFunction,
    ) {
        self.instrumented.write().insert(function.into(), compiled);
    }

    /// Number of successful `compile` calls so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::SeqCst)
    }
}

impl Backend for StaticBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn compile(
        &self,
        function: &str,
        _module: &Module,
        options: &CompileOptions,
    ) -> Result<CompiledFunction, BackendError> {
        let instrumented = if options.instrument {
            self.instrumented.read().get(function).cloned()
        } else {
            None
        };
        let compiled = instrumented
            .or_else(|| self.functions.read().get(function).cloned())
            .ok_or_else(|| BackendError::FunctionNotFound {
                backend: self.kind.clone(),
                function: function.to_string(),
            })?;
        self.compile_count.fetch_add(1, Ordering::SeqCst);
        Ok(compiled)
    }
}
