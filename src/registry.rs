//! Global heap registry and thread-local heap lookup (§4.7, collaborator
//! with a concrete default supplied).
//!
//! Grounded on this codebase's own `init.rs` (`heap_init`/`heap_done`,
//! backing-heap-vs-default-heap distinction) and `internal.rs`'s
//! `get_default_heap`, reworked from raw `static mut` globals and C-shaped
//! process/thread lifecycle callbacks into `std::thread_local!` + `Drop` —
//! the idiomatic Rust equivalent of the same contract. The free-heap queue
//! below is diagnostic bookkeeping only (which heap ids have retired); it
//! does not reclaim a retired heap's memory for reuse by another thread,
//! matching this codebase's own decision that recycling happens solely
//! through a `ThreadHeap`'s `Drop` glue.

use core::sync::atomic::{AtomicUsize, Ordering};

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_heap_id() -> usize {
    NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Ticket spinlock: `0` means unlocked, any other value is the id of the
/// thread currently holding it (mirrors the spec's "CAS on a word holding
/// the current holder's thread id" description).
struct SpinLock {
    holder: AtomicUsize,
}

impl SpinLock {
    const fn new() -> Self {
        SpinLock {
            holder: AtomicUsize::new(0),
        }
    }

    fn lock(&self, who: usize) {
        while self
            .holder
            .compare_exchange_weak(0, who, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.holder.store(0, Ordering::Release);
    }
}

struct RetiredHeap {
    id: usize,
    next: Option<alloc::boxed::Box<RetiredHeap>>,
}

static FREE_HEAPS_LOCK: SpinLock = SpinLock::new();
static mut FREE_HEAPS: Option<alloc::boxed::Box<RetiredHeap>> = None;

/// Record that heap `id` has fully released its memory back to the OS.
/// Called from `Heap::drop`. The critical section here only ever touches
/// `FREE_HEAPS` while holding `FREE_HEAPS_LOCK`.
pub fn retire_heap(id: usize) {
    FREE_HEAPS_LOCK.lock(id.max(1));
    unsafe {
        let node = alloc::boxed::Box::new(RetiredHeap {
            id,
            next: FREE_HEAPS.take(),
        });
        FREE_HEAPS = Some(node);
    }
    FREE_HEAPS_LOCK.unlock();
}

/// Number of heaps that have retired so far in this process (diagnostic).
pub fn retired_heap_count() -> usize {
    let mut count = 0;
    FREE_HEAPS_LOCK.lock(usize::MAX);
    unsafe {
        let mut cursor = FREE_HEAPS.as_deref();
        while let Some(node) = cursor {
            count += 1;
            cursor = node.next.as_deref();
        }
    }
    FREE_HEAPS_LOCK.unlock();
    count
}

/// Looks up the calling thread's heap. `StdThreadHeap` is the default,
/// `thread_local!`-backed implementation; an embedder without `std` (or with
/// an unusual threading model — a green-thread runtime, a single-threaded
/// firmware image) supplies its own.
pub trait ThreadHeap {
    fn with<R>(f: impl FnOnce(&mut crate::heap::Heap<'static>) -> R) -> R;
}

#[cfg(feature = "std")]
mod std_thread_heap {
    use super::{next_heap_id, ThreadHeap};
    use crate::heap::Heap;
    use crate::os::SystemMemory;
    use std::cell::RefCell;

    static BACKEND: SystemMemory = SystemMemory::new();

    std::thread_local! {
        static HEAP: RefCell<Heap<'static>> =
            RefCell::new(Heap::new(next_heap_id(), &BACKEND));
    }

    pub struct StdThreadHeap;

    impl ThreadHeap for StdThreadHeap {
        fn with<R>(f: impl FnOnce(&mut Heap<'static>) -> R) -> R {
            HEAP.with(|cell| f(&mut cell.borrow_mut()))
        }
    }
}

#[cfg(feature = "std")]
pub use std_thread_heap::StdThreadHeap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retiring_heaps_increments_registry_count() {
        let before = retired_heap_count();
        retire_heap(next_heap_id());
        retire_heap(next_heap_id());
        assert_eq!(retired_heap_count(), before + 2);
    }

    #[test]
    fn heap_ids_are_monotonic_and_unique() {
        let a = next_heap_id();
        let b = next_heap_id();
        assert!(b > a);
    }
}
