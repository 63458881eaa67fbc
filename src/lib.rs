//! A thread-caching, lock-free general-purpose allocator built from three
//! layers: size classes (`size_class`), span-backed pages (`span`, `page`),
//! and a per-thread heap coordinator (`heap`) reached through a global
//! registry (`registry`).
//!
//! `no_std` by default; the `std` feature (on by default) adds the
//! `thread_local!`-backed `ThreadHeap` and environment-variable option
//! overrides. Without `std`, an embedder supplies its own `ThreadHeap`.

#![no_std]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod constants;
pub mod error;
pub mod heap;
pub mod options;
pub mod os;
pub mod page;
pub mod registry;
pub mod size_class;
pub mod span;
pub mod stats;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use error::AllocError;

pub use error::{last_error, set_last_error};
pub use registry::ThreadHeap;
#[cfg(feature = "std")]
pub use registry::StdThreadHeap;

/// `GlobalAlloc` facade over a `ThreadHeap`. Install with:
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: caimalloc::Caimalloc<caimalloc::StdThreadHeap> = caimalloc::Caimalloc::new();
/// ```
pub struct Caimalloc<H: ThreadHeap> {
    _heap: core::marker::PhantomData<H>,
}

impl<H: ThreadHeap> Caimalloc<H> {
    pub const fn new() -> Self {
        Caimalloc {
            _heap: core::marker::PhantomData,
        }
    }
}

impl<H: ThreadHeap> Default for Caimalloc<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn layout_size(layout: Layout) -> Result<usize, AllocError> {
    if layout.size() == 0 {
        // A zero-sized allocation still needs a unique, non-null, properly
        // aligned pointer per `GlobalAlloc`'s contract; one byte at the
        // requested alignment satisfies that cheaply.
        Ok(layout.align().max(1))
    } else {
        Ok(layout.size())
    }
}

unsafe impl<H: ThreadHeap> GlobalAlloc for Caimalloc<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = match layout_size(layout) {
            Ok(s) => s,
            Err(e) => {
                set_last_error(e);
                return core::ptr::null_mut();
            }
        };
        let result = H::with(|heap| {
            if layout.align() <= constants::G {
                heap.allocate(size)
            } else {
                heap.allocate_aligned(size, layout.align())
            }
        });
        match result {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                set_last_error(e);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        H::with(|heap| heap.deallocate(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
        };
        let old_size = layout_size(layout).unwrap_or(layout.size());
        let result = H::with(|heap| {
            if layout.align() <= constants::G {
                heap.reallocate(ptr, old_size, new_size)
            } else {
                heap.reallocate_aligned(ptr, old_size, new_size, layout.align())
            }
        });
        match result {
            Ok(p) => p.as_ptr(),
            Err(e) => {
                set_last_error(e);
                core::ptr::null_mut()
            }
        }
    }
}

/// Free-standing equivalent of `Caimalloc::alloc`, for callers that want a
/// `Result` instead of `GlobalAlloc`'s null-on-failure convention.
pub fn alloc<H: ThreadHeap>(size: usize) -> Result<NonNull<u8>, AllocError> {
    H::with(|heap| heap.allocate(size))
}

/// Free-standing equivalent of `Caimalloc::dealloc`.
pub fn free<H: ThreadHeap>(ptr: NonNull<u8>) {
    H::with(|heap| heap.deallocate(ptr));
}

/// Allocate `count * size` bytes, zero-initialized, checking for overflow.
pub fn calloc<H: ThreadHeap>(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;
    let ptr = H::with(|heap| heap.allocate(total))?;
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
}

/// Resize a previous allocation, preserving its contents up to
/// `min(old_size, new_size)`.
pub fn realloc<H: ThreadHeap>(
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
) -> Result<NonNull<u8>, AllocError> {
    H::with(|heap| heap.reallocate(ptr, old_size, new_size))
}

/// Allocate `size` bytes aligned to `align` (must be a power of two).
pub fn aligned_alloc<H: ThreadHeap>(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    H::with(|heap| heap.allocate_aligned(size, align))
}

/// Resize a previous aligned allocation, preserving `align`.
pub fn aligned_realloc<H: ThreadHeap>(
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
) -> Result<NonNull<u8>, AllocError> {
    H::with(|heap| heap.reallocate_aligned(ptr, old_size, new_size, align))
}

/// Usable capacity of the block backing `ptr`, as returned by `alloc` or
/// `aligned_alloc` (counted from `ptr` itself for an aligned interior
/// pointer, not the block's true start).
pub fn usable_size<H: ThreadHeap>(ptr: NonNull<u8>) -> usize {
    H::with(|heap| heap.usable_size(ptr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StdThreadHeap;

    #[test]
    fn facade_alloc_then_free_round_trips() {
        let p = alloc::<StdThreadHeap>(128).expect("allocation should succeed");
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0x11, 128) };
        free::<StdThreadHeap>(p);
    }

    #[test]
    fn calloc_zeroes_memory() {
        let p = calloc::<StdThreadHeap>(16, 8).expect("calloc should succeed");
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        free::<StdThreadHeap>(p);
    }

    #[test]
    fn usable_size_covers_the_requested_bytes() {
        let p = alloc::<StdThreadHeap>(40).expect("allocation should succeed");
        assert!(usable_size::<StdThreadHeap>(p) >= 40);
        free::<StdThreadHeap>(p);
    }

    #[test]
    fn aligned_realloc_preserves_contents_and_alignment() {
        let align = 4096;
        let p = aligned_alloc::<StdThreadHeap>(64, align).expect("aligned allocation should succeed");
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0x5A, 64) };
        let grown = aligned_realloc::<StdThreadHeap>(p, 64, 512, align).expect("aligned realloc should succeed");
        assert_eq!(grown.as_ptr() as usize % align, 0);
        let bytes = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        free::<StdThreadHeap>(grown);
    }

    #[test]
    fn global_alloc_layout_round_trips_through_vec() {
        let allocator: Caimalloc<StdThreadHeap> = Caimalloc::new();
        let layout = Layout::from_size_align(256, 8).unwrap();
        let p = unsafe { allocator.alloc(layout) };
        assert!(!p.is_null());
        unsafe {
            core::ptr::write_bytes(p, 0x22, 256);
            allocator.dealloc(p, layout);
        }
    }
}
