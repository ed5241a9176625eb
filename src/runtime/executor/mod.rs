//! Executor: runs one compiled artifact for one request
//!
//! Every call follows the same bounded sequence:
//!
//! ```text
//! allocate -> copy-in -> invoke -> copy-out -> release -> trace
//! ```
//!
//! The mutable-weight and activation regions are [`AlignedBuffer`]s owned by
//! the call, so they are released on every exit path. Constants belong to the
//! bundle and are never reallocated per call.

mod plan;
mod trace;

pub use plan::{CopyEntry, CopyPlan};

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace as trace_log};

use crate::runtime::artifact::{ArtifactBuffers, CompiledArtifact, InvocationError, ENTRY_SYMBOL};
use crate::runtime::bundle::RuntimeBundle;
use crate::runtime::context::ExecutionContext;
use crate::runtime::memory::{system_allocator, AlignedBuffer, AllocError, Allocator};
use crate::runtime::trace::TraceLevel;

/// Errors raised while executing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The entry symbol cannot be resolved: a build or link mismatch, not retryable
    #[error("artifact `{artifact}` has no entry symbol `{symbol}`")]
    MissingEntryPoint { artifact: String, symbol: String },
    /// A per-call region could not be allocated
    #[error("failed to allocate {region} region: {source}")]
    Allocation {
        region: &'static str,
        #[source]
        source: AllocError,
    },
    /// The artifact reported a failure
    #[error("artifact `{artifact}` failed: {source}")]
    Invocation {
        artifact: String,
        #[source]
        source: InvocationError,
    },
    /// A bound tensor is smaller than the symbol it feeds
    #[error("binding `{name}` holds {actual} bytes but its symbol needs {expected}")]
    BindingSize {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// A trace backing tensor named by the artifact is not bound
    #[error("trace backing tensor `{0}` is not bound")]
    MissingTraceBacking(String),
    /// A trace event slot lies past the end of its backing tensor
    #[error("trace event `{event}` reads past the end of backing tensor `{backing}`")]
    TraceBackingTooSmall { backing: String, event: String },
    /// A copy plan entry lies outside the bundle's mutable-weight region,
    /// so the plan was resolved for another bundle
    #[error("copy plan entry `{name}` does not fit the {region_size}-byte mutable-weight region")]
    PlanMismatch { name: String, region_size: usize },
    /// The device has no artifact loaded under this task name
    #[error("task `{0}` is not loaded on this device")]
    NotLoaded(String),
}

impl ExecutionError {
    /// Whether retrying the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Allocation { .. })
    }
}

/// Runs compiled artifacts against request bindings.
#[derive(Debug, Clone)]
pub struct Executor {
    allocator: Arc<dyn Allocator>,
}

impl Executor {
    /// Executor allocating from the system allocator.
    pub fn new() -> Self {
        Self::with_allocator(system_allocator())
    }

    /// Executor allocating per-call regions from `allocator`.
    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }

    /// Allocator used for per-call regions.
    #[inline]
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Execute `artifact` once against the bindings of `ctx`.
    ///
    /// Bound names absent from the bundle's symbol table are ignored.
    pub fn execute(
        &self,
        artifact: &CompiledArtifact,
        bundle: &RuntimeBundle,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let plan = CopyPlan::resolve(bundle, &ctx.bindings());
        self.execute_with_plan(artifact, bundle, &plan, ctx)
    }

    /// Execute with a copy plan resolved earlier for the same bundle.
    pub fn execute_with_plan(
        &self,
        artifact: &CompiledArtifact,
        bundle: &RuntimeBundle,
        plan: &CopyPlan,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        debug!(
            artifact = artifact.name(),
            mutable = bundle.mutable_weight_size(),
            activations = bundle.activations_size(),
            copies = plan.len(),
            "executing artifact"
        );

        plan.check_fits(bundle.mutable_weight_size())?;
        self.invoke(artifact, bundle, plan, ctx)?;

        if let Some(sink) = ctx.trace() {
            let info = artifact.trace_info();
            if info.enabled && sink.should_log(TraceLevel::RUNTIME) {
                let bindings = ctx.bindings();
                trace::translate_trace_events(info, &bindings, sink)?;
            }
        }
        Ok(())
    }

    /// Allocate, copy in, invoke and copy out. Both regions drop on return.
    fn invoke(
        &self,
        artifact: &CompiledArtifact,
        bundle: &RuntimeBundle,
        plan: &CopyPlan,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let mut mutable_weights =
            AlignedBuffer::for_region(bundle.mutable_weight_size(), &self.allocator).map_err(
                |source| ExecutionError::Allocation {
                    region: "mutable weight",
                    source,
                },
            )?;
        let mut activations =
            AlignedBuffer::for_region(bundle.activations_size(), &self.allocator).map_err(
                |source| ExecutionError::Allocation {
                    region: "activation",
                    source,
                },
            )?;

        plan.copy_in(&ctx.bindings(), region_mut(&mut mutable_weights))?;

        let entry = artifact
            .find_symbol(ENTRY_SYMBOL)
            .ok_or_else(|| ExecutionError::MissingEntryPoint {
                artifact: artifact.name().to_string(),
                symbol: ENTRY_SYMBOL.to_string(),
            })?;

        trace_log!(artifact = artifact.name(), "invoking entry point");
        entry(ArtifactBuffers {
            constants: bundle.constants().unwrap_or(&[]),
            mutable_weights: region_mut(&mut mutable_weights),
            activations: region_mut(&mut activations),
        })
        .map_err(|source| ExecutionError::Invocation {
            artifact: artifact.name().to_string(),
            source,
        })?;

        plan.copy_out(&mut ctx.bindings(), region(&mutable_weights));
        Ok(())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn region(buffer: &Option<AlignedBuffer>) -> &[u8] {
    match buffer {
        Some(buffer) => buffer.as_slice(),
        None => &[],
    }
}

#[inline]
fn region_mut(buffer: &mut Option<AlignedBuffer>) -> &mut [u8] {
    match buffer {
        Some(buffer) => buffer.as_mut_slice(),
        None => &mut [],
    }
}
