//! Program metadata handed over by the compiler stage
//!
//! A [`Module`] names the functions (partitions) of a program, the
//! placeholders they exchange, and the constant payloads they read. Schedules
//! keep a stripped copy holding only names and sizes.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

/// Placeholder descriptor: a named host tensor exchanged with artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderInfo {
    /// Placeholder name
    pub name: String,
    /// Size in bytes
    pub size: usize,
}

/// Program metadata.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Function names, one per partition
    functions: IndexSet<String>,
    /// Placeholders by name
    placeholders: IndexMap<String, PlaceholderInfo>,
    /// Constant payloads by name
    constants: IndexMap<String, Arc<[u8]>>,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function. Returns false if it was already declared.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
    ) -> bool {
        self.functions.insert(name.into())
    }

    /// Whether a function with this name exists.
    #[inline]
    pub fn has_function(
        &self,
        name: &str,
    ) -> bool {
        self.functions.contains(name)
    }

    /// Function names in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    /// Declare a placeholder of `size` bytes.
    pub fn add_placeholder(
        &mut self,
        name: impl Into<String>,
        size: usize,
    ) {
        let name = name.into();
        self.placeholders
            .insert(name.clone(), PlaceholderInfo { name, size });
    }

    /// Look up a placeholder.
    pub fn placeholder(
        &self,
        name: &str,
    ) -> Option<&PlaceholderInfo> {
        self.placeholders.get(name)
    }

    /// Placeholders in declaration order.
    pub fn placeholders(&self) -> impl Iterator<Item = &PlaceholderInfo> {
        self.placeholders.values()
    }

    /// Attach a constant payload.
    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
    ) {
        self.constants.insert(name.into(), payload.into());
    }

    /// Look up a constant payload.
    pub fn constant(
        &self,
        name: &str,
    ) -> Option<&[u8]> {
        self.constants.get(name).map(|payload| &payload[..])
    }

    /// Number of constant payloads.
    pub fn num_constants(&self) -> usize {
        self.constants.len()
    }

    /// Copy holding only function and placeholder metadata.
    pub fn stripped(&self) -> Module {
        Module {
            functions: self.functions.clone(),
            placeholders: self.placeholders.clone(),
            constants: IndexMap::new(),
        }
    }
}
