//! Per-request execution state
//!
//! An [`ExecutionContext`] carries the host tensors bound to placeholder
//! names and an optional trace sink. It lives for one request; tasks of that
//! request running on different devices share it and lock the bindings only
//! while copying in or out.

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use crate::runtime::module::Module;
use crate::runtime::trace::TraceContext;

/// Host-side tensor: a contiguous byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tensor {
    data: Vec<u8>,
}

impl Tensor {
    /// A zero-filled tensor of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// A tensor of `size` bytes, every byte set to `value`.
    pub fn filled(
        size: usize,
        value: u8,
    ) -> Self {
        Self {
            data: vec![value; size],
        }
    }

    /// Wrap an existing payload.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Size in bytes.
    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// Raw payload.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw mutable payload.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume into the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Host tensors keyed by placeholder name, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderBindings {
    tensors: IndexMap<String, Tensor>,
}

impl PlaceholderBindings {
    /// Empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tensor` to `name`, returning the previous binding.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor,
    ) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(
        mut self,
        name: impl Into<String>,
        tensor: Tensor,
    ) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Look up a tensor.
    #[inline]
    pub fn get(
        &self,
        name: &str,
    ) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Look up a tensor for writing.
    #[inline]
    pub fn get_mut(
        &mut self,
        name: &str,
    ) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    /// Bind a zeroed tensor to every placeholder of `module` not bound yet.
    ///
    /// Returns the number of tensors added.
    pub fn allocate(
        &mut self,
        module: &Module,
    ) -> usize {
        let mut added = 0;
        for placeholder in module.placeholders() {
            if !self.tensors.contains_key(&placeholder.name) {
                self.tensors
                    .insert(placeholder.name.clone(), Tensor::zeroed(placeholder.size));
                added += 1;
            }
        }
        added
    }

    /// Remove a binding.
    pub fn remove(
        &mut self,
        name: &str,
    ) -> Option<Tensor> {
        self.tensors.shift_remove(name)
    }

    /// Whether `name` is bound.
    #[inline]
    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.tensors.contains_key(name)
    }

    /// Number of bindings.
    #[inline]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether nothing is bound.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Bound names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// `(name, tensor)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }
}

/// State of one request.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    bindings: Mutex<PlaceholderBindings>,
    trace: Option<TraceContext>,
}

impl ExecutionContext {
    /// Context without tracing.
    pub fn new(bindings: PlaceholderBindings) -> Self {
        Self {
            bindings: Mutex::new(bindings),
            trace: None,
        }
    }

    /// Context with a trace sink.
    pub fn with_trace(
        bindings: PlaceholderBindings,
        trace: TraceContext,
    ) -> Self {
        Self {
            bindings: Mutex::new(bindings),
            trace: Some(trace),
        }
    }

    /// Lock the bindings.
    #[inline]
    pub fn bindings(&self) -> MutexGuard<'_, PlaceholderBindings> {
        self.bindings.lock()
    }

    /// The trace sink, if tracing is on.
    #[inline]
    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    /// Consume the context, returning the bindings.
    pub fn into_bindings(self) -> PlaceholderBindings {
        self.bindings.into_inner()
    }

    /// Consume the context, returning bindings and trace sink.
    pub fn into_parts(self) -> (PlaceholderBindings, Option<TraceContext>) {
        (self.bindings.into_inner(), self.trace)
    }
}
