//! Heap layer (§4.5): the per-thread coordinator that owns spans, hands out
//! pages per size class, and serves the huge-allocation path directly from
//! the OS.
//!
//! Grounded on this codebase's own `Heap`/`PageQueue` (per-class page lists)
//! and `internal.rs`'s `heap_get_free_small_page`; the huge path's direct
//! span-sized OS mapping mirrors the `alloc_large` shape used elsewhere in
//! the retrieval pack, adapted from a flat page heap to this crate's
//! span/tier model.

use crate::constants::{align_up, is_power_of_two, MAX_ALIGN};
use crate::error::AllocError;
use crate::os::MemoryBackend;
use crate::page::{Page, PageState};
use crate::size_class::{class_of, class_info, tier_of, Tier, NUM_CLASSES};
use crate::span::{span_of, Span};
use crate::stats::GLOBAL_STATS;
use core::ptr::NonNull;

/// One per-class bucket: pages with room to allocate, and pages that filled
/// up and are parked until a remote free (or the owner's next miss) frees
/// them back up.
#[derive(Clone, Copy)]
struct PageQueue {
    available: Option<NonNull<Page>>,
    full: Option<NonNull<Page>>,
}

impl PageQueue {
    const fn empty() -> Self {
        PageQueue {
            available: None,
            full: None,
        }
    }
}

fn list_push(head: &mut Option<NonNull<Page>>, mut page: NonNull<Page>) {
    unsafe {
        page.as_mut().prev = None;
        page.as_mut().next = *head;
        if let Some(mut old_head) = *head {
            old_head.as_mut().prev = Some(page);
        }
    }
    *head = Some(page);
}

fn list_remove(head: &mut Option<NonNull<Page>>, mut page: NonNull<Page>) {
    unsafe {
        let prev = page.as_ref().prev;
        let next = page.as_ref().next;
        match prev {
            Some(mut p) => p.as_mut().next = next,
            None => *head = next,
        }
        if let Some(mut n) = next {
            n.as_mut().prev = prev;
        }
        page.as_mut().next = None;
        page.as_mut().prev = None;
    }
}

pub struct Heap<'a> {
    pub id: usize,
    backend: &'a dyn MemoryBackend,
    queues: [PageQueue; NUM_CLASSES],
    /// Span currently being carved for each tier (small/medium/large); a new
    /// span is acquired once the current one runs out of uninitialized pages.
    active_span: [Option<NonNull<Span>>; 3],
    /// Every span this heap has ever acquired for a tier, active or not.
    spans: [alloc::vec::Vec<NonNull<Span>>; 3],
}

fn tier_slot(tier: Tier) -> usize {
    match tier {
        Tier::Small => 0,
        Tier::Medium => 1,
        Tier::Large => 2,
        Tier::Huge => unreachable!("huge tier has no span slot"),
    }
}

impl<'a> Heap<'a> {
    pub fn new(id: usize, backend: &'a dyn MemoryBackend) -> Self {
        GLOBAL_STATS.threads.increase(1);
        Heap {
            id,
            backend,
            queues: [PageQueue::empty(); NUM_CLASSES],
            active_span: [None, None, None],
            spans: [alloc::vec::Vec::new(), alloc::vec::Vec::new(), alloc::vec::Vec::new()],
        }
    }

    fn page_for_class(&mut self, class: u32) -> Option<NonNull<Page>> {
        let queue = &mut self.queues[class as usize];
        if let Some(mut page) = queue.available {
            unsafe {
                if !page.as_ref().has_free() {
                    page.as_mut().collect_thread_free();
                }
                if page.as_ref().has_free() {
                    return Some(page);
                }
                // Went full since it was last used; park it and keep looking.
                list_remove(&mut queue.available, page);
                list_push(&mut queue.full, page);
                page.as_mut().state = PageState::Full;
            }
        }
        // Miss: sweep the full list for anything a remote free reopened.
        let mut cursor = queue.full;
        while let Some(mut page) = cursor {
            let next = unsafe { page.as_ref().next };
            unsafe { page.as_mut().collect_thread_free() };
            if unsafe { page.as_ref().has_free() } {
                list_remove(&mut queue.full, page);
                list_push(&mut queue.available, page);
                unsafe { page.as_mut().state = PageState::Available };
                return Some(page);
            }
            cursor = next;
        }
        self.carve_new_page(class)
    }

    fn carve_new_page(&mut self, class: u32) -> Option<NonNull<Page>> {
        let tier = tier_of(class);
        let block_size = class_info(class).block_size;
        let slot = tier_slot(tier);

        if self.active_span[slot].is_none() {
            let span = Span::acquire(self.backend, tier)?;
            self.active_span[slot] = Some(span);
            self.spans[slot].push(span);
        }

        let owner = unsafe { NonNull::new_unchecked(self as *mut Heap<'a> as *mut ()) };
        loop {
            let span_ptr = self.active_span[slot]?;
            let page = unsafe { (*span_ptr.as_ptr()).next_page(block_size, class) };
            if let Some(mut page) = page {
                unsafe { page.as_mut().heap = Some(owner) };
                list_push(&mut self.queues[class as usize].available, page);
                return Some(page);
            }
            // Current span exhausted; get a fresh one and retry once.
            let fresh = Span::acquire(self.backend, tier)?;
            self.active_span[slot] = Some(fresh);
            self.spans[slot].push(fresh);
        }
    }

    fn allocate_class(&mut self, class: u32) -> Result<NonNull<u8>, AllocError> {
        let page = self.page_for_class(class).ok_or(AllocError::OutOfMemory)?;
        let ptr = unsafe { (*page.as_ptr()).allocate_local() }.ok_or(AllocError::OutOfMemory)?;
        if unsafe { (*page.as_ptr()).is_full() } {
            let queue = &mut self.queues[class as usize];
            list_remove(&mut queue.available, page);
            list_push(&mut queue.full, page);
            unsafe { (*page.as_ptr()).state = PageState::Full };
        }
        Ok(ptr)
    }

    /// Huge allocations are mapped directly rather than carved from a span,
    /// but still carry a `Span` header (tagged `Tier::Huge`) at their base so
    /// `deallocate` can recognize and unmap them through the same
    /// `span_of` masking used for every other pointer this heap hands out.
    /// That header costs `SPAN_HEADER` bytes out of the mapping, mirroring
    /// the cost every span's own first page already pays.
    fn allocate_huge(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = align_up(
            size.checked_add(crate::constants::SPAN_HEADER)
                .ok_or(AllocError::InvalidArgument)?,
            crate::constants::HUGE_ALIGN,
        );
        let mapping = self
            .backend
            .map_aligned(total, crate::constants::HUGE_ALIGN, true)
            .ok_or(AllocError::OutOfMemory)?;
        let span_ptr = mapping.ptr.as_ptr() as *mut Span;
        unsafe {
            span_ptr.write(Span {
                mapping,
                tier: Tier::Huge,
                page_size: mapping.size,
                page_count: 1,
                next_uninit: 1,
                pages_in_use: 1,
                next: None,
                prev: None,
            });
        }
        GLOBAL_STATS.huge.increase(1);
        let user_addr = mapping.ptr.as_ptr() as usize + crate::constants::SPAN_HEADER;
        Ok(unsafe { NonNull::new_unchecked(user_addr as *mut u8) })
    }

    /// Allocate `size` bytes at natural alignment.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        GLOBAL_STATS.malloc.increase(1);
        match class_of(size) {
            Some(class) => self.allocate_class(class),
            None => self.allocate_huge(size),
        }
    }

    /// Allocate `size` bytes aligned to `align` (must be a power of two).
    /// Alignments at or below `G` ride the natural small/medium/large path
    /// (every block in those tiers is already `G`-aligned); larger
    /// alignments up to `MAX_ALIGN` overallocate within a page and flag the
    /// page as holding an aligned block; alignments at or above `MAX_ALIGN`
    /// take the huge path, which is always span-aligned.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !is_power_of_two(align) {
            return Err(AllocError::InvalidArgument);
        }
        if align <= crate::constants::G {
            return self.allocate(size);
        }
        if align >= MAX_ALIGN {
            return self.allocate_huge(size.max(align));
        }
        // Overallocate by `align` to guarantee an aligned sub-block exists,
        // then hand back the aligned interior pointer. The class bookkeeping
        // still tracks the true block for freeing purposes because
        // `span_of`/page arithmetic mask down to the block's real start, not
        // the aligned pointer the caller sees, so mark the page as holding
        // an aligned block to keep `usable_size` honest.
        let padded = size.checked_add(align).ok_or(AllocError::InvalidArgument)?;
        let class = class_of(padded).ok_or(AllocError::InvalidArgument)?;
        let page = self.page_for_class(class).ok_or(AllocError::OutOfMemory)?;
        let base = unsafe { (*page.as_ptr()).allocate_local() }.ok_or(AllocError::OutOfMemory)?;
        unsafe { (*page.as_ptr()).has_aligned_block = true };
        let aligned = align_up(base.as_ptr() as usize, align);
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Free a pointer previously returned by this heap or by any other
    /// heap — `ptr` may be an interior aligned pointer, in which case it is
    /// rounded back down to its page's block boundary. Dispatches on the
    /// span's tier and, for span-backed blocks, on whether the calling
    /// heap is the one that carved the page: a different heap's page takes
    /// the lock-free remote-free path instead of touching this heap's own
    /// page-queue lists.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let span = span_of(ptr.as_ptr());
        if unsafe { span.as_ref().tier } == Tier::Huge {
            let mapping = unsafe { span.as_ref().mapping };
            self.backend.unmap(mapping.ptr, mapping.size);
            GLOBAL_STATS.huge.decrease(1);
            return;
        }

        let page = page_of(span, ptr.as_ptr());
        let block = block_base(page, ptr);
        let me = unsafe { NonNull::new_unchecked(self as *mut Heap<'a> as *mut ()) };
        if unsafe { (*page.as_ptr()).heap } != Some(me) {
            unsafe { (*page.as_ptr()).free_remote(block) };
            return;
        }

        let was_full = unsafe { (*page.as_ptr()).is_full() };
        unsafe { (*page.as_ptr()).free_local(block) };
        if was_full {
            let class = unsafe { (*page.as_ptr()).class_hint() };
            let queue = &mut self.queues[class as usize];
            list_remove(&mut queue.full, page);
            list_push(&mut queue.available, page);
            unsafe { (*page.as_ptr()).state = PageState::Available };
        }
    }

    /// Reallocate in place when the new size still fits the current block's
    /// capacity; otherwise allocate-copy-free with anti-thrash growth
    /// rounding (grow requests are padded by 11/8 so a tight sequence of
    /// +1-byte grows doesn't re-allocate every time).
    pub fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if let (Some(old_class), Some(new_class)) = (class_of(old_size), class_of(new_size)) {
            if old_class == new_class {
                // Same bucket either way: in-place shrink needs nothing
                // (capacity already covers it); in-place grow is safe for the
                // same reason.
                return Ok(ptr);
            }
        }
        let grow_target = if new_size > old_size {
            (new_size * 11 / 8).max(new_size)
        } else {
            new_size
        };
        let fresh = self.allocate(grow_target)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
        }
        self.deallocate(ptr);
        Ok(fresh)
    }

    /// Reallocate while requiring the new block satisfy `align` (as
    /// `allocate_aligned` would) — always allocate-copy-free, since the old
    /// block's alignment may no longer suffice for the new size.
    pub fn reallocate_aligned(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if align <= crate::constants::G {
            return self.reallocate(ptr, old_size, new_size);
        }
        let grow_target = if new_size > old_size {
            (new_size * 11 / 8).max(new_size)
        } else {
            new_size
        };
        let fresh = self.allocate_aligned(grow_target, align)?;
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
        }
        self.deallocate(ptr);
        Ok(fresh)
    }

    /// Usable capacity of the block backing `ptr`, counted from `ptr` itself
    /// (not the block's true start) so an aligned interior pointer reports
    /// the bytes actually safe to use through it.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let span = span_of(ptr.as_ptr());
        if unsafe { span.as_ref().tier } == Tier::Huge {
            let mapping = unsafe { span.as_ref().mapping };
            return mapping.size - crate::constants::SPAN_HEADER;
        }
        let page = page_of(span, ptr.as_ptr());
        let base = block_base(page, ptr);
        let block_size = unsafe { (*page.as_ptr()).block_size };
        block_size - (ptr.as_ptr() as usize - base.as_ptr() as usize)
    }
}

impl<'a> Drop for Heap<'a> {
    /// Per §9's resolution of heap recycling: there is no cross-thread
    /// reclaim of another thread's still-live heap. A thread's spans may
    /// still hold blocks that escaped to another thread (e.g. a `Box` sent
    /// across a channel) and are freed only after this heap is gone, so
    /// `Drop` does not unmap them — the owning `Span`/`Page` headers live in
    /// the mapping itself and keep working for a remote free with no
    /// `Heap` behind them. This abandons every span the thread ever
    /// acquired to the OS for the life of the process; reclaiming
    /// abandoned-but-empty spans is left as a known limitation rather than
    /// building the cross-thread scan this would require.
    fn drop(&mut self) {
        GLOBAL_STATS.threads.decrease(1);
        crate::registry::retire_heap(self.id);
    }
}

/// Compute the page header pointer for a block pointer, given its span.
fn page_of(span: NonNull<Span>, ptr: *const u8) -> NonNull<Page> {
    let (span_base, page_size) = unsafe {
        let s = span.as_ref();
        (span.as_ptr() as usize, s.page_size)
    };
    let offset = ptr as usize - span_base;
    let idx = offset / page_size;
    let page_base = span_base + idx * page_size;
    let header_addr = if idx == 0 {
        page_base + crate::constants::SPAN_HEADER
    } else {
        page_base
    };
    unsafe { NonNull::new_unchecked(header_addr as *mut Page) }
}

/// Round an interior aligned pointer back down to its containing block's
/// true start, needed because `allocate_aligned` may have handed out a
/// pointer strictly inside the block it actually owns.
fn block_base(page: NonNull<Page>, ptr: NonNull<u8>) -> NonNull<u8> {
    let (block_start, block_size) = unsafe {
        let p = page.as_ref();
        (p.block_start, p.block_size)
    };
    let offset = ptr.as_ptr() as usize - block_start;
    let index = offset / block_size;
    let base = block_start + index * block_size;
    unsafe { NonNull::new_unchecked(base as *mut u8) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::SystemMemory;

    #[test]
    fn allocate_and_free_small_round_trips() {
        let backend = SystemMemory::new();
        let mut heap = Heap::new(1, &backend);
        let p = heap.allocate(64).expect("allocation should succeed");
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xAB, 64) };
        heap.deallocate(p);
    }

    #[test]
    fn huge_allocation_round_trips() {
        let backend = SystemMemory::new();
        let mut heap = Heap::new(1, &backend);
        let p = heap.allocate(64 * 1024 * 1024).expect("huge allocation should succeed");
        heap.deallocate(p);
    }

    #[test]
    fn aligned_allocation_honors_alignment() {
        let backend = SystemMemory::new();
        let mut heap = Heap::new(1, &backend);
        let align = 4096;
        let p = heap.allocate_aligned(256, align).expect("aligned allocation should succeed");
        assert_eq!(p.as_ptr() as usize % align, 0);
        heap.deallocate(p);
    }
}
