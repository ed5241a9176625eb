//! Copy plans: bindings resolved against a bundle's symbol table
//!
//! Resolving walks the bindings once and keeps only names that are
//! placeholders of the bundle. A plan can be reused for every call whose
//! bindings carry the same names.

use crate::runtime::bundle::{RuntimeBundle, SymbolCategory};
use crate::runtime::context::PlaceholderBindings;

use super::ExecutionError;

/// One resolved copy between a binding and the mutable-weight region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    /// Binding name
    pub name: String,
    /// Offset in the mutable-weight region
    pub offset: usize,
    /// Bytes to copy
    pub size: usize,
}

/// Resolved copies for one bundle and one binding name set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyPlan {
    entries: Vec<CopyEntry>,
}

impl CopyPlan {
    /// Resolve every binding that names a placeholder of `bundle`.
    pub fn resolve(
        bundle: &RuntimeBundle,
        bindings: &PlaceholderBindings,
    ) -> Self {
        let entries = bindings
            .names()
            .filter_map(|name| {
                let info = bundle
                    .symbol(name)
                    .filter(|info| info.category == SymbolCategory::Placeholder)?;
                Some(CopyEntry {
                    name: name.to_string(),
                    offset: info.offset,
                    size: info.size,
                })
            })
            .collect();
        Self { entries }
    }

    /// Resolved entries in binding order.
    #[inline]
    pub fn entries(&self) -> &[CopyEntry] {
        &self.entries
    }

    /// Number of resolved entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing resolved.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every entry lies inside a mutable-weight region of
    /// `region_size` bytes.
    pub fn check_fits(
        &self,
        region_size: usize,
    ) -> Result<(), ExecutionError> {
        for entry in &self.entries {
            if entry_end(entry).map_or(true, |end| end > region_size) {
                return Err(ExecutionError::PlanMismatch {
                    name: entry.name.clone(),
                    region_size,
                });
            }
        }
        Ok(())
    }

    /// Copy each resolved binding into `region`.
    ///
    /// Entries whose binding disappeared since resolution are skipped.
    pub(crate) fn copy_in(
        &self,
        bindings: &PlaceholderBindings,
        region: &mut [u8],
    ) -> Result<(), ExecutionError> {
        for entry in &self.entries {
            let Some(tensor) = bindings.get(&entry.name) else {
                continue;
            };
            let payload = tensor.as_bytes();
            if payload.len() < entry.size {
                return Err(ExecutionError::BindingSize {
                    name: entry.name.clone(),
                    expected: entry.size,
                    actual: payload.len(),
                });
            }
            let region_size = region.len();
            let target = entry_end(entry)
                .and_then(|end| region.get_mut(entry.offset..end))
                .ok_or_else(|| ExecutionError::PlanMismatch {
                    name: entry.name.clone(),
                    region_size,
                })?;
            target.copy_from_slice(&payload[..entry.size]);
        }
        Ok(())
    }

    /// Copy each resolved binding back out of `region`, overwriting it.
    pub(crate) fn copy_out(
        &self,
        bindings: &mut PlaceholderBindings,
        region: &[u8],
    ) {
        for entry in &self.entries {
            if let Some(tensor) = bindings.get_mut(&entry.name) {
                let payload = tensor.as_bytes_mut();
                let size = entry.size.min(payload.len());
                let source = entry
                    .offset
                    .checked_add(size)
                    .and_then(|end| region.get(entry.offset..end));
                if let Some(source) = source {
                    payload[..size].copy_from_slice(source);
                }
            }
        }
    }
}

#[inline]
fn entry_end(entry: &CopyEntry) -> Option<usize> {
    entry.offset.checked_add(entry.size)
}
