//! Structural constants for the span/page/heap layout.
//!
//! These are bit-exact: a page header written by one build must be readable by
//! another build of this crate (even though no cross-process sharing is
//! supported, the layout itself must stay stable).

#[cfg(target_pointer_width = "64")]
pub const PTR_SHIFT: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const PTR_SHIFT: usize = 2;

pub const PTR_SIZE: usize = 1 << PTR_SHIFT;

/// Smallest allocation granularity.
pub const G: usize = 32;

pub const PAGE_HEADER: usize = 128;
pub const SPAN_HEADER: usize = 128;

/// Every span is a single `SPAN_SIZE`-aligned reservation; pages of exactly one
/// tier live inside it.
pub const SPAN_SHIFT: usize = 28; // 256 MiB
pub const SPAN_SIZE: usize = 1 << SPAN_SHIFT;
pub const SPAN_MASK: usize = SPAN_SIZE - 1;

pub const SMALL_PAGE_SHIFT: usize = 16; // 64 KiB
pub const MEDIUM_PAGE_SHIFT: usize = 22; // 4 MiB
pub const LARGE_PAGE_SHIFT: usize = 26; // 64 MiB

pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

pub const SMALL_PAGES_PER_SPAN: usize = SPAN_SIZE / SMALL_PAGE_SIZE;
pub const MEDIUM_PAGES_PER_SPAN: usize = SPAN_SIZE / MEDIUM_PAGE_SIZE;
pub const LARGE_PAGES_PER_SPAN: usize = SPAN_SIZE / LARGE_PAGE_SIZE;

/// Alignment requests at or above this must go through the overallocate path;
/// requests at or above this value are rejected as invalid.
pub const MAX_ALIGN: usize = 256 * 1024;

/// Huge-span alignment for direct OS mappings (mirrors `SPAN_SIZE`, kept as a
/// distinct name since a huge span's own size may exceed one span's worth).
pub const HUGE_ALIGN: usize = SPAN_SIZE;

#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size & !(align - 1)
}

#[inline]
pub const fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}
