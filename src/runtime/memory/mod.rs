//! Memory management for artifact buffers
//!
//! Buffers handed to a compiled artifact are owned by an [`AlignedBuffer`],
//! which returns its memory to the allocator it came from when dropped. The
//! executor relies on this to release per-invocation regions on every exit
//! path, including a failing artifact invocation.

mod allocator;

pub use allocator::{
    align_up, AllocError, Allocator, MemoryLayout, SystemAllocator, TrackingAllocator,
    TENSOR_ALIGNMENT,
};

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// An owned, zero-initialized, tensor-aligned byte region.
///
/// The visible length is exactly the requested size; the underlying
/// allocation may be rounded up to the alignment.
pub struct AlignedBuffer {
    /// Start of the allocation
    ptr: NonNull<u8>,
    /// Requested length in bytes
    len: usize,
    /// Layout used for the allocation
    layout: MemoryLayout,
    /// Allocator the memory is returned to
    allocator: Arc<dyn Allocator>,
}

// Safety: the buffer uniquely owns its allocation; shared access only hands
// out `&[u8]`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `len` bytes aligned to [`TENSOR_ALIGNMENT`].
    ///
    /// Zero-length regions are not allocated: `Ok(None)` is returned.
    pub fn for_region(
        len: usize,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Option<Self>, AllocError> {
        if len == 0 {
            return Ok(None);
        }
        let layout =
            MemoryLayout::tensor(len).ok_or(AllocError::AlignmentError(TENSOR_ALIGNMENT))?;
        let ptr = allocator.alloc_zeroed(layout)?;
        Ok(Some(Self {
            ptr,
            len,
            layout,
            allocator: Arc::clone(allocator),
        }))
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_bytes(
        bytes: &[u8],
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Option<Self>, AllocError> {
        let mut buffer = Self::for_region(bytes.len(), allocator)?;
        if let Some(buffer) = buffer.as_mut() {
            buffer.as_mut_slice().copy_from_slice(bytes);
        }
        Ok(buffer)
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: empty regions are never allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// View the region as bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for len initialized (zeroed) bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the region as mutable bytes.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for len bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safety: ptr and layout come from this allocator and are released once
        unsafe { self.allocator.dealloc(self.ptr, self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// The shared system allocator as a trait object.
pub fn system_allocator() -> Arc<dyn Allocator> {
    Arc::new(SystemAllocator)
}
