//! Runtime bundle: the memory plan of one compiled partition
//!
//! A bundle records three region sizes and a symbol table:
//!
//! - constants: read-only weights, loaded once and shared by every call
//! - mutable weights: inputs and outputs, copied in and out on every call
//! - activations: scratch space with no state across calls
//!
//! Each symbol lives in exactly one region at a fixed `offset`. Symbols of
//! the same region never overlap and never extend past the region end.

use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::runtime::memory::{align_up, system_allocator, AlignedBuffer, TENSOR_ALIGNMENT};
use crate::runtime::module::Module;

/// Region a symbol belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolCategory {
    /// Read-only constant weight
    Constant,
    /// Input or output tensor in the mutable-weight region
    Placeholder,
    /// Scratch tensor in the activation region
    Activation,
}

/// Location of a symbol inside its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Byte offset from the region base
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
    /// Region
    pub category: SymbolCategory,
}

impl SymbolInfo {
    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Errors raised while building or filling a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// A symbol extends past its region
    #[error("symbol `{name}` ends at byte {end}, past its {region_size}-byte region")]
    OutOfRegion {
        name: String,
        end: usize,
        region_size: usize,
    },
    /// Two symbols of the same region overlap
    #[error("symbols `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },
    /// A symbol extends past the address space
    #[error("symbol `{0}` does not fit in the address space")]
    TooLarge(String),
    /// Constants and mutable weights together overflow `usize`
    #[error("regions of {constant} and {mutable} bytes exceed the address space")]
    FootprintOverflow { constant: usize, mutable: usize },
    /// A symbol name was declared twice
    #[error("symbol `{0}` declared twice")]
    DuplicateSymbol(String),
    /// A constant symbol has no payload in the module
    #[error("constant `{0}` has no payload in the module")]
    MissingConstant(String),
    /// A constant payload does not match its symbol size
    #[error("constant `{name}` has {actual} bytes, symbol expects {expected}")]
    ConstantSize {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// The constants region could not be allocated
    #[error("failed to allocate constants region: {0}")]
    Allocation(#[from] crate::runtime::memory::AllocError),
}

/// Memory plan of one compiled partition.
#[derive(Debug, Clone)]
pub struct RuntimeBundle {
    symbol_table: IndexMap<String, SymbolInfo>,
    constants: Option<Arc<AlignedBuffer>>,
    constant_weight_size: usize,
    mutable_weight_size: usize,
    activations_size: usize,
}

impl RuntimeBundle {
    /// Create a bundle, checking that symbols fit their regions and do not
    /// overlap.
    pub fn new(
        symbol_table: IndexMap<String, SymbolInfo>,
        constant_weight_size: usize,
        mutable_weight_size: usize,
        activations_size: usize,
    ) -> Result<Self, BundleError> {
        let bundle = Self {
            symbol_table,
            constants: None,
            constant_weight_size,
            mutable_weight_size,
            activations_size,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> Result<(), BundleError> {
        if self
            .constant_weight_size
            .checked_add(self.mutable_weight_size)
            .is_none()
        {
            return Err(BundleError::FootprintOverflow {
                constant: self.constant_weight_size,
                mutable: self.mutable_weight_size,
            });
        }

        for category in [
            SymbolCategory::Constant,
            SymbolCategory::Placeholder,
            SymbolCategory::Activation,
        ] {
            let region_size = self.region_size(category);
            let mut symbols: Vec<(&String, &SymbolInfo)> = self
                .symbol_table
                .iter()
                .filter(|(_, info)| info.category == category)
                .collect();
            symbols.sort_by_key(|(_, info)| (info.offset, info.size));

            for (name, info) in &symbols {
                let end = info
                    .offset
                    .checked_add(info.size)
                    .filter(|end| *end <= region_size);
                if end.is_none() {
                    return Err(BundleError::OutOfRegion {
                        name: (*name).clone(),
                        end: info.offset.saturating_add(info.size),
                        region_size,
                    });
                }
            }

            // Sweep in offset order, tracking the symbol reaching furthest.
            let mut furthest: Option<(&String, usize)> = None;
            for (name, info) in symbols.iter().filter(|(_, info)| info.size > 0) {
                if let Some((first, end)) = furthest {
                    if info.offset < end {
                        return Err(BundleError::Overlap {
                            first: first.clone(),
                            second: (*name).clone(),
                        });
                    }
                }
                if furthest.map_or(true, |(_, end)| info.end() > end) {
                    furthest = Some((*name, info.end()));
                }
            }
        }
        Ok(())
    }

    /// Size of the region holding `category` symbols.
    pub fn region_size(
        &self,
        category: SymbolCategory,
    ) -> usize {
        match category {
            SymbolCategory::Constant => self.constant_weight_size,
            SymbolCategory::Placeholder => self.mutable_weight_size,
            SymbolCategory::Activation => self.activations_size,
        }
    }

    /// Size of the read-only constants region.
    #[inline]
    pub fn constant_weight_size(&self) -> usize {
        self.constant_weight_size
    }

    /// Size of the input/output region.
    #[inline]
    pub fn mutable_weight_size(&self) -> usize {
        self.mutable_weight_size
    }

    /// Size of the scratch region.
    #[inline]
    pub fn activations_size(&self) -> usize {
        self.activations_size
    }

    /// Bytes a device must reserve to hold this partition.
    #[inline]
    pub fn device_footprint(&self) -> usize {
        self.constant_weight_size
            .saturating_add(self.mutable_weight_size)
    }

    /// The full symbol table.
    #[inline]
    pub fn symbol_table(&self) -> &IndexMap<String, SymbolInfo> {
        &self.symbol_table
    }

    /// Look up one symbol.
    #[inline]
    pub fn symbol(
        &self,
        name: &str,
    ) -> Option<&SymbolInfo> {
        self.symbol_table.get(name)
    }

    /// Symbols of the mutable-weight region.
    pub fn placeholders(&self) -> impl Iterator<Item = (&str, &SymbolInfo)> {
        self.symbol_table
            .iter()
            .filter(|(_, info)| info.category == SymbolCategory::Placeholder)
            .map(|(name, info)| (name.as_str(), info))
    }

    /// The loaded constants region, if any.
    pub fn constants(&self) -> Option<&[u8]> {
        self.constants.as_deref().map(AlignedBuffer::as_slice)
    }

    /// Whether constants still need to be collected.
    pub fn needs_constants(&self) -> bool {
        self.constant_weight_size > 0 && self.constants.is_none()
    }

    /// Copy every constant payload from `module` into a freshly allocated
    /// constants region.
    ///
    /// The region is allocated once; later calls on a bundle that already
    /// holds constants do nothing.
    pub fn collect_constants(
        &mut self,
        module: &Module,
    ) -> Result<(), BundleError> {
        if !self.needs_constants() {
            return Ok(());
        }

        let allocator = system_allocator();
        let mut region = match AlignedBuffer::for_region(self.constant_weight_size, &allocator)? {
            Some(region) => region,
            None => return Ok(()),
        };

        for (name, info) in &self.symbol_table {
            if info.category != SymbolCategory::Constant {
                continue;
            }
            let payload = module
                .constant(name)
                .ok_or_else(|| BundleError::MissingConstant(name.clone()))?;
            if payload.len() != info.size {
                return Err(BundleError::ConstantSize {
                    name: name.clone(),
                    expected: info.size,
                    actual: payload.len(),
                });
            }
            region.as_mut_slice()[info.offset..info.end()].copy_from_slice(payload);
        }

        self.constants = Some(Arc::new(region));
        Ok(())
    }
}

/// Incremental bundle construction.
///
/// Each symbol is placed at the next [`TENSOR_ALIGNMENT`] boundary of its
/// region.
#[derive(Debug, Clone, Default)]
pub struct RuntimeBundleBuilder {
    symbols: IndexMap<String, SymbolInfo>,
    constant_weight_size: usize,
    mutable_weight_size: usize,
    activations_size: usize,
    error: Option<BundleError>,
}

impl RuntimeBundleBuilder {
    /// Create an empty builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant of `size` bytes.
    pub fn constant(
        self,
        name: impl Into<String>,
        size: usize,
    ) -> Self {
        self.push(name.into(), size, SymbolCategory::Constant)
    }

    /// Add an input/output placeholder of `size` bytes.
    pub fn placeholder(
        self,
        name: impl Into<String>,
        size: usize,
    ) -> Self {
        self.push(name.into(), size, SymbolCategory::Placeholder)
    }

    /// Add a scratch activation of `size` bytes.
    pub fn activation(
        self,
        name: impl Into<String>,
        size: usize,
    ) -> Self {
        self.push(name.into(), size, SymbolCategory::Activation)
    }

    fn push(
        mut self,
        name: String,
        size: usize,
        category: SymbolCategory,
    ) -> Self {
        let cursor = match category {
            SymbolCategory::Constant => &mut self.constant_weight_size,
            SymbolCategory::Placeholder => &mut self.mutable_weight_size,
            SymbolCategory::Activation => &mut self.activations_size,
        };
        let Some((offset, end)) = align_up(*cursor, TENSOR_ALIGNMENT)
            .and_then(|offset| Some((offset, offset.checked_add(size)?)))
        else {
            self.error.get_or_insert(BundleError::TooLarge(name));
            return self;
        };
        *cursor = end;

        let info = SymbolInfo {
            offset,
            size,
            category,
        };
        if self.symbols.insert(name.clone(), info).is_some() {
            self.error.get_or_insert(BundleError::DuplicateSymbol(name));
        }
        self
    }

    /// Finish the bundle.
    pub fn build(self) -> Result<RuntimeBundle, BundleError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        RuntimeBundle::new(
            self.symbols,
            self.constant_weight_size,
            self.mutable_weight_size,
            self.activations_size,
        )
    }
}
