//! Compiled artifacts
//!
//! A [`CompiledArtifact`] is the opaque result of compiling one partition.
//! It exposes named entry points taking the three base regions of a
//! [`RuntimeBundle`](crate::runtime::bundle::RuntimeBundle) and a trace
//! descriptor. The runtime never looks inside an entry point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::runtime::bundle::RuntimeBundle;
use crate::runtime::trace::TraceInfo;

/// Symbol the executor invokes.
pub const ENTRY_SYMBOL: &str = "main";

/// Base regions passed to an entry point.
#[derive(Debug)]
pub struct ArtifactBuffers<'a> {
    /// Read-only constants, loaded once at provision time
    pub constants: &'a [u8],
    /// Inputs and outputs for this call
    pub mutable_weights: &'a mut [u8],
    /// Scratch space for this call
    pub activations: &'a mut [u8],
}

/// Failure reported by an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvocationError(pub String);

impl InvocationError {
    /// Create an error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callable entry point of an artifact.
pub type EntryPoint =
    Arc<dyn Fn(ArtifactBuffers<'_>) -> Result<(), InvocationError> + Send + Sync>;

/// Opaque compiled partition.
#[derive(Clone)]
pub struct CompiledArtifact {
    name: String,
    symbols: HashMap<String, EntryPoint>,
    trace_info: TraceInfo,
}

impl CompiledArtifact {
    /// Create an artifact with no symbols.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: HashMap::new(),
            trace_info: TraceInfo::disabled(),
        }
    }

    /// An artifact whose entry point does nothing.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name).with_entry(|_| Ok(()))
    }

    /// Register `f` as the entry point.
    pub fn with_entry<F>(
        self,
        f: F,
    ) -> Self
    where
        F: Fn(ArtifactBuffers<'_>) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.with_symbol(ENTRY_SYMBOL, f)
    }

    /// Register `f` under `symbol`.
    pub fn with_symbol<F>(
        mut self,
        symbol: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(ArtifactBuffers<'_>) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.symbols.insert(symbol.into(), Arc::new(f));
        self
    }

    /// Attach a trace descriptor.
    pub fn with_trace_info(
        mut self,
        trace_info: TraceInfo,
    ) -> Self {
        self.trace_info = trace_info;
        self
    }

    /// Artifact name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve a symbol.
    #[inline]
    pub fn find_symbol(
        &self,
        symbol: &str,
    ) -> Option<&EntryPoint> {
        self.symbols.get(symbol)
    }

    /// Trace descriptor.
    #[inline]
    pub fn trace_info(&self) -> &TraceInfo {
        &self.trace_info
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut symbols: Vec<&str> = self.symbols.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        f.debug_struct("CompiledArtifact")
            .field("name", &self.name)
            .field("symbols", &symbols)
            .field("trace_enabled", &self.trace_info.enabled)
            .finish()
    }
}

/// An artifact paired with the bundle it was compiled against.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// Compiled code
    pub artifact: Arc<CompiledArtifact>,
    /// Memory plan
    pub bundle: Arc<RuntimeBundle>,
}

impl CompiledFunction {
    /// Pair an artifact with its bundle.
    pub fn new(
        artifact: CompiledArtifact,
        bundle: RuntimeBundle,
    ) -> Self {
        Self {
            artifact: Arc::new(artifact),
            bundle: Arc::new(bundle),
        }
    }
}
