//! Page layer (§4.4): a fixed-size page carved into equal blocks of one size
//! class, with a local free-list for the owning thread and a lock-free
//! cross-thread free-list for remote frees.
//!
//! Grounded on this codebase's own `Page`/`ThreadFree`/`PageFlags` layout and
//! `block_next`/`block_set_next` cookie-free-list encoding; the packed-word
//! compare-exchange loop for the cross-thread list follows the `Anchor`
//! pattern used for lock-free heaps elsewhere in the retrieval pack.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicU32, Ordering};

const NIL: u32 = u32::MAX;

/// Cross-thread free-list token: block index in the low 32 bits, a push
/// counter in the high 32 bits (guards against ABA across concurrent remote
/// frees, not against a true unbounded overflow, which would require
/// billions of pushes on a single page).
#[inline]
fn encode_token(head: u32, count: u32) -> u64 {
    (u64::from(count) << 32) | u64::from(head)
}

#[inline]
fn decode_token(token: u64) -> (u32, u32) {
    (token as u32, (token >> 32) as u32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    Uninitialized,
    Available,
    Full,
}

/// Page header, written in place at the start of the page's header region
/// (see `Span::next_page`). `block_start`/`usable` describe the block array
/// that follows this header in memory.
#[repr(C)]
pub struct Page {
    pub block_size: usize,
    pub block_start: usize,
    pub capacity: u32,
    pub used: u32,
    /// Head of the thread-local free list, as a block index, `NIL` if empty.
    pub local_free: u32,
    /// Cross-thread free list token; remote frees CAS-push into this.
    pub thread_free: AtomicU64,
    pub has_aligned_block: bool,
    pub index_in_span: u32,
    /// Size-class index this page was carved for; lets a page locate its own
    /// `PageQueue` bucket again after a free reopens it.
    pub class: u32,
    pub state: PageState,
    pub heap: Option<NonNull<()>>,
    pub next: Option<NonNull<Page>>,
    pub prev: Option<NonNull<Page>>,
    _reserved: AtomicU32,
}

impl Page {
    /// Initialize a page header at `header_addr`, with `block_start` the
    /// first usable byte and `usable` bytes of block storage following it.
    pub fn init(
        header_addr: usize,
        block_start: usize,
        usable: usize,
        block_size: usize,
        index_in_span: u32,
        class: u32,
    ) -> NonNull<Page> {
        let capacity = (usable / block_size) as u32;
        let page_ptr = header_addr as *mut Page;
        unsafe {
            page_ptr.write(Page {
                block_size,
                block_start,
                capacity,
                used: 0,
                local_free: NIL,
                thread_free: AtomicU64::new(encode_token(NIL, 0)),
                has_aligned_block: false,
                index_in_span,
                class,
                state: PageState::Available,
                heap: None,
                next: None,
                prev: None,
                _reserved: AtomicU32::new(0),
            });
        }
        unsafe { NonNull::new_unchecked(page_ptr) }
    }

    #[inline]
    pub fn class_hint(&self) -> u32 {
        self.class
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut u8 {
        (self.block_start + index as usize * self.block_size) as *mut u8
    }

    #[inline]
    fn block_index(&self, ptr: *const u8) -> u32 {
        ((ptr as usize - self.block_start) / self.block_size) as u32
    }

    #[inline]
    fn read_next(&self, index: u32) -> u32 {
        unsafe { (self.block_ptr(index) as *const u32).read() }
    }

    #[inline]
    fn write_next(&self, index: u32, next: u32) {
        unsafe { (self.block_ptr(index) as *mut u32).write(next) };
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    pub fn has_free(&self) -> bool {
        self.local_free != NIL || self.used < self.capacity
    }

    pub fn all_free(&self) -> bool {
        self.used == 0
    }

    /// Pull every block queued by remote-freeing threads onto the local
    /// free-list. Called by the owning thread whenever a local allocation
    /// would otherwise miss (§9: drain-on-miss policy).
    pub fn collect_thread_free(&mut self) {
        let token = self.thread_free.swap(encode_token(NIL, 0), Ordering::AcqRel);
        let (mut head, count) = decode_token(token);
        if head == NIL {
            return;
        }
        // Walk the remotely-freed chain to find its tail, then splice it in
        // front of the existing local free-list.
        let mut tail = head;
        let mut n = 1u32;
        while n < count {
            tail = self.read_next(tail);
            n += 1;
        }
        self.write_next(tail, self.local_free);
        self.local_free = head;
        self.used -= count;
        let _ = &mut head;
    }

    /// Allocate one block from the local free-list. Caller must have ensured
    /// `has_free()` (after a `collect_thread_free` if needed).
    pub fn allocate_local(&mut self) -> Option<NonNull<u8>> {
        if self.local_free == NIL {
            if self.used >= self.capacity {
                return None;
            }
            let index = self.used;
            self.used += 1;
            return NonNull::new(self.block_ptr(index));
        }
        let index = self.local_free;
        self.local_free = self.read_next(index);
        self.used += 1;
        NonNull::new(self.block_ptr(index))
    }

    /// Free a block owned by the calling (owning) thread.
    pub fn free_local(&mut self, ptr: NonNull<u8>) {
        let index = self.block_index(ptr.as_ptr());
        self.write_next(index, self.local_free);
        self.local_free = index;
        self.used -= 1;
    }

    /// Free a block from a thread that does not own this page. Lock-free
    /// CAS-push onto `thread_free`. This codebase resolves the "does a
    /// remote free need to eagerly notice a page going full?" question as:
    /// no — the owning thread reconciles `thread_free` into `used` on every
    /// local allocation miss (`collect_thread_free`), so a page that was
    /// full only becomes visibly free again once its owner looks.
    pub fn free_remote(&self, ptr: NonNull<u8>) {
        let index = self.block_index(ptr.as_ptr());
        loop {
            let token = self.thread_free.load(Ordering::Acquire);
            let (head, count) = decode_token(token);
            unsafe { (self.block_ptr(index) as *mut u32).write(head) };
            let new_token = encode_token(index, count + 1);
            if self
                .thread_free
                .compare_exchange_weak(token, new_token, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    fn make_test_page(block_size: usize, capacity: u32) -> (NonNull<Page>, *mut u8) {
        let usable = block_size * capacity as usize;
        let layout = Layout::from_size_align(usable + 128, 64).unwrap();
        let backing = unsafe { std::alloc::alloc(layout) };
        let header_addr = backing as usize;
        let block_start = header_addr + 128;
        let page = Page::init(header_addr, block_start, usable, block_size, 0, 0);
        (page, backing)
    }

    #[test]
    fn allocate_local_exhausts_then_returns_none() {
        let (mut page_ptr, backing) = make_test_page(64, 4);
        let page = unsafe { page_ptr.as_mut() };
        let mut seen = std::vec::Vec::new();
        for _ in 0..4 {
            seen.push(page.allocate_local().expect("capacity available"));
        }
        assert!(page.allocate_local().is_none());
        assert!(page.is_full());
        unsafe {
            std::alloc::dealloc(backing, Layout::from_size_align(64 * 4 + 128, 64).unwrap())
        };
    }

    #[test]
    fn free_then_reallocate_reuses_block() {
        let (mut page_ptr, backing) = make_test_page(64, 4);
        let page = unsafe { page_ptr.as_mut() };
        let a = page.allocate_local().unwrap();
        let b = page.allocate_local().unwrap();
        page.free_local(a);
        let c = page.allocate_local().unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr());
        assert_eq!(page.used, 2);
        let _ = b;
        unsafe {
            std::alloc::dealloc(backing, Layout::from_size_align(64 * 4 + 128, 64).unwrap())
        };
    }

    #[test]
    fn remote_free_is_collected_by_owner() {
        let (mut page_ptr, backing) = make_test_page(64, 4);
        let page = unsafe { page_ptr.as_mut() };
        let a = page.allocate_local().unwrap();
        let _b = page.allocate_local().unwrap();
        page.free_remote(a);
        assert_eq!(page.used, 2); // not yet reconciled, owner hasn't collected
        page.collect_thread_free();
        assert_eq!(page.used, 1);
        let again = page.allocate_local().unwrap();
        assert_eq!(again.as_ptr(), a.as_ptr());
        unsafe {
            std::alloc::dealloc(backing, Layout::from_size_align(64 * 4 + 128, 64).unwrap())
        };
    }
}
