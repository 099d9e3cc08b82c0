//! Native block management - zeroed heap memory handed to native code
//!
//! Design: One allocation per block, aligned for any C scalar, zero-filled so
//! a freshly allocated structure reads as all-zero fields.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use super::Pointer;
use crate::error::{config_error, Result};
use crate::logging::{log_allocation, log_deallocation};

/// Alignment of every block, enough for `long double` and SIMD fields
const BLOCK_ALIGN: usize = 16;

/// A zeroed native allocation
pub struct NativeBlock {
    start: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain bytes with no thread affinity. Concurrent
// writers are excluded by the single-writer discipline of the owners.
unsafe impl Send for NativeBlock {}
unsafe impl Sync for NativeBlock {}

impl NativeBlock {
    /// Allocate `size` zeroed bytes
    pub fn zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(config_error!("cannot allocate a native block of zero bytes"));
        }
        let layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .map_err(|e| config_error!("cannot allocate {size} bytes: {e}"))?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(start) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        log_allocation(size, start.as_ptr());
        Ok(Self { start, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline]
    pub fn pointer(&self) -> Pointer {
        Pointer::from_raw(self.start.as_ptr())
    }
}

impl Drop for NativeBlock {
    fn drop(&mut self) {
        log_deallocation(self.layout.size(), self.start.as_ptr());
        // SAFETY: allocated in `zeroed` with this exact layout
        unsafe {
            dealloc(self.start.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for NativeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeBlock({:?}, {} bytes)", self.start, self.len())
    }
}

/// Align offset upward to next multiple of alignment
///
/// Uses bit manipulation for branch-free execution:
/// - `(value + align - 1) & !(align - 1)`
/// - Requires power-of-2 alignment
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
