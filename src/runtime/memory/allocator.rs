//! Allocator interface for runtime buffers
//!
//! This module defines the `Allocator` trait used for every buffer the
//! runtime hands to a compiled artifact: the constants region of a bundle and
//! the per-invocation mutable-weight and activation regions.
//!
//! # Design Principles
//! - Simple trait: alloc / alloc_zeroed / dealloc
//! - `&self` receivers so one allocator can be shared by all device workers
//! - Send + Sync for thread safety

use core::alloc::Layout;
use core::ptr::NonNull;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Alignment required for every tensor region handed to an artifact.
///
/// Compiled artifacts assume their base addresses are aligned to this value.
pub const TENSOR_ALIGNMENT: usize = 64;

/// Memory allocation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Not enough memory to satisfy the allocation
    #[error("out of memory ({requested} bytes requested)")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },
    /// Alignment requirements cannot be satisfied
    #[error("invalid alignment {0}")]
    AlignmentError(usize),
}

/// Memory layout helper
///
/// Wraps `std::alloc::Layout` with convenient constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    size: usize,
    align: usize,
}

impl MemoryLayout {
    /// Create a layout from size and alignment
    ///
    /// The size is rounded up to a multiple of the alignment.
    ///
    /// # Returns
    /// `Some(MemoryLayout)` if alignment is valid (power of 2), `None` otherwise.
    pub fn from_size_align(
        size: usize,
        align: usize,
    ) -> Option<Self> {
        if align == 0 || !align.is_power_of_two() {
            return None;
        }

        let aligned_size = align_up(size, align)?;
        // Rejects sizes that would overflow isize once rounded.
        Layout::from_size_align(aligned_size, align).ok()?;

        Some(Self {
            size: aligned_size,
            align,
        })
    }

    /// Layout for a tensor region of `size` bytes.
    #[inline]
    pub fn tensor(size: usize) -> Option<Self> {
        Self::from_size_align(size, TENSOR_ALIGNMENT)
    }

    /// Get the size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment
    pub fn align(&self) -> usize {
        self.align
    }

    /// Convert to std::alloc::Layout
    pub fn to_std_layout(&self) -> Layout {
        // Safety: size and align are validated in from_size_align
        unsafe { Layout::from_size_align_unchecked(self.size, self.align) }
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` when the rounded value does not fit in `usize`.
#[inline]
pub fn align_up(
    value: usize,
    align: usize,
) -> Option<usize> {
    value
        .checked_add(align - 1)
        .map(|value| value & !(align - 1))
}

/// Core allocator trait
///
/// # Implementations
/// - `SystemAllocator`: wraps the global allocator
/// - `TrackingAllocator`: counts live allocations, used to check release paths
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate memory with the given layout
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<NonNull<u8>, AllocError>;

    /// Allocate zeroed memory with the given layout
    fn alloc_zeroed(
        &self,
        layout: MemoryLayout,
    ) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.alloc(layout)?;
        // Safety: ptr is valid for layout.size() bytes
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, layout.size());
        }
        Ok(ptr)
    }

    /// Deallocate memory
    ///
    /// # Safety
    /// `ptr` must come from a previous `alloc` or `alloc_zeroed` call on this
    /// allocator with the same `layout`, and must not be used afterwards.
    unsafe fn dealloc(
        &self,
        ptr: NonNull<u8>,
        layout: MemoryLayout,
    );
}

/// Allocator backed by the process-wide global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError::OutOfMemory { requested: 0 });
        }
        // Safety: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc(layout.to_std_layout()) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            requested: layout.size(),
        })
    }

    fn alloc_zeroed(
        &self,
        layout: MemoryLayout,
    ) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError::OutOfMemory { requested: 0 });
        }
        // Safety: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout.to_std_layout()) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            requested: layout.size(),
        })
    }

    unsafe fn dealloc(
        &self,
        ptr: NonNull<u8>,
        layout: MemoryLayout,
    ) {
        std::alloc::dealloc(ptr.as_ptr(), layout.to_std_layout());
    }
}

/// Allocator that records every allocation and release.
///
/// Wraps `SystemAllocator`. Optionally refuses the n-th allocation so tests
/// can drive the allocation-failure path.
#[derive(Debug, Default)]
pub struct TrackingAllocator {
    inner: SystemAllocator,
    live_allocations: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
    /// 1-based index of the allocation to refuse, 0 for never.
    fail_on: AtomicUsize,
}

impl TrackingAllocator {
    /// Create a tracking allocator that never refuses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the `n`-th allocation (1-based) counted from now on.
    pub fn fail_on_nth(
        &self,
        n: usize,
    ) {
        let base = self.total_allocations.load(Ordering::SeqCst);
        self.fail_on.store(base + n, Ordering::SeqCst);
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    /// Bytes held by allocations not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    /// Number of allocation attempts so far.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::SeqCst)
    }
}

impl Allocator for TrackingAllocator {
    fn alloc(
        &self,
        layout: MemoryLayout,
    ) -> Result<NonNull<u8>, AllocError> {
        let attempt = self.total_allocations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.load(Ordering::SeqCst) == attempt {
            return Err(AllocError::OutOfMemory {
                requested: layout.size(),
            });
        }

        let ptr = self.inner.alloc(layout)?;
        self.live_allocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(layout.size(), Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn dealloc(
        &self,
        ptr: NonNull<u8>,
        layout: MemoryLayout,
    ) {
        self.inner.dealloc(ptr, layout);
        self.live_allocations.fetch_sub(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}
