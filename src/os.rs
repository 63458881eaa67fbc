//! OS memory backend (§6): map, commit, decommit, and unmap whole regions.
//!
//! `MemoryBackend` is the collaborator the span layer calls through; a span is
//! always `SPAN_SIZE`-aligned, so the interesting part of this module is the
//! aligned-overallocate-and-trim dance, carried over from this codebase's own
//! `os_mem_alloc_aligned`.

use crate::constants::{align_down, align_up, is_power_of_two};
use crate::options::{option_is_enabled, Option_};
use crate::stats::GLOBAL_STATS;
use core::ptr::NonNull;
use log::warn;

#[cfg(not(windows))]
use libc::{madvise, mmap, mprotect, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::{
    shared::minwindef::LPVOID,
    um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
    um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
};

/// A reservation obtained from a [`MemoryBackend`]; always page-size-aligned
/// and at least `size` bytes, but not necessarily aligned to a caller-chosen
/// alignment (see [`MemoryBackend::map_aligned`] for that guarantee).
#[derive(Clone, Copy)]
pub struct Mapping {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

/// Abstracts the primitive OS operations the span layer needs. `SystemMemory`
/// is the default, real-OS implementation; an embedder targeting a
/// constrained environment (a custom arena, a hypervisor-backed pool) can
/// supply its own.
pub trait MemoryBackend {
    fn page_size(&self) -> usize;
    fn map(&self, size: usize, commit: bool) -> Option<Mapping>;
    fn map_aligned(&self, size: usize, align: usize, commit: bool) -> Option<Mapping>;
    fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool;
    fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool;
    fn unmap(&self, ptr: NonNull<u8>, size: usize) -> bool;
    fn reset(&self, ptr: NonNull<u8>, size: usize) -> bool;
}

pub struct SystemMemory;

impl SystemMemory {
    pub const fn new() -> Self {
        SystemMemory
    }

    fn good_size(&self, size: usize) -> usize {
        align_up(size, self.page_size())
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        SystemMemory::new()
    }
}

#[cfg(windows)]
impl MemoryBackend for SystemMemory {
    fn page_size(&self) -> usize {
        unsafe {
            let mut si: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut si);
            if si.dwPageSize > 0 {
                si.dwPageSize as usize
            } else {
                4096
            }
        }
    }

    fn map(&self, size: usize, commit: bool) -> Option<Mapping> {
        if size == 0 {
            return None;
        }
        let size = self.good_size(size);
        let flags = if commit { MEM_RESERVE | MEM_COMMIT } else { MEM_RESERVE };
        let p = unsafe { VirtualAlloc(core::ptr::null_mut(), size, flags, PAGE_READWRITE) } as *mut u8;
        let ptr = NonNull::new(p)?;
        GLOBAL_STATS.mmap_calls.record(1);
        GLOBAL_STATS.reserved.increase(size as i64);
        if commit {
            GLOBAL_STATS.committed.increase(size as i64);
        }
        Some(Mapping { ptr, size })
    }

    fn map_aligned(&self, size: usize, align: usize, commit: bool) -> Option<Mapping> {
        debug_assert!(is_power_of_two(align));
        // Windows cannot unmap sub-ranges of a reservation, so the
        // overallocate-trim trick used on Unix doesn't apply; retry a few
        // times hoping the allocator happens to hand back an aligned region,
        // which in practice it very often does for large power-of-two sizes.
        for _ in 0..8 {
            let m = self.map(size, commit)?;
            if m.ptr.as_ptr() as usize % align == 0 {
                return Some(m);
            }
            self.unmap(m.ptr, m.size);
        }
        warn!("map_aligned: giving up after 8 attempts (size={size}, align={align})");
        None
    }

    fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = !unsafe { VirtualAlloc(ptr.as_ptr() as LPVOID, size, MEM_COMMIT, PAGE_READWRITE) }.is_null();
        if ok {
            GLOBAL_STATS.committed.increase(size as i64);
            GLOBAL_STATS.commit_calls.record(1);
        } else {
            warn!("VirtualAlloc(commit) failed for {size} bytes");
        }
        ok
    }

    fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = unsafe { VirtualFree(ptr.as_ptr() as LPVOID, size, MEM_DECOMMIT) } != 0;
        if ok {
            GLOBAL_STATS.committed.decrease(size as i64);
        } else {
            warn!("VirtualFree(decommit) failed for {size} bytes");
        }
        ok
    }

    fn unmap(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = unsafe { VirtualFree(ptr.as_ptr() as LPVOID, 0, MEM_RELEASE) } != 0;
        GLOBAL_STATS.reserved.decrease(size as i64);
        if !ok {
            warn!("VirtualFree(release) failed, addr {:p}", ptr.as_ptr());
        }
        ok
    }

    fn reset(&self, ptr: NonNull<u8>, size: usize) -> bool {
        self.decommit(ptr, size) && self.commit(ptr, size)
    }
}

#[cfg(not(windows))]
impl MemoryBackend for SystemMemory {
    fn page_size(&self) -> usize {
        let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if r > 0 {
            r as usize
        } else {
            4096
        }
    }

    fn map(&self, size: usize, commit: bool) -> Option<Mapping> {
        if size == 0 {
            return None;
        }
        let size = self.good_size(size);
        let protect = if commit { PROT_READ | PROT_WRITE } else { PROT_NONE };
        let p = unsafe { mmap(core::ptr::null_mut(), size, protect, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0) };
        GLOBAL_STATS.mmap_calls.record(1);
        if p == MAP_FAILED {
            warn!("mmap failed: {}", errno::errno());
            return None;
        }
        let ptr = NonNull::new(p as *mut u8)?;
        GLOBAL_STATS.reserved.increase(size as i64);
        if commit {
            GLOBAL_STATS.committed.increase(size as i64);
        }
        Some(Mapping { ptr, size })
    }

    fn map_aligned(&self, size: usize, align: usize, commit: bool) -> Option<Mapping> {
        debug_assert!(is_power_of_two(align) && align >= self.page_size());
        let size = self.good_size(size);
        let m = self.map(size, commit)?;
        if m.ptr.as_ptr() as usize % align == 0 {
            return Some(m);
        }
        // Overallocate by `align` extra bytes, then unmap the slack before
        // and after the aligned sub-range we actually want.
        self.unmap(m.ptr, m.size);
        let over_size = size.checked_add(align)?;
        let over = self.map(over_size, commit)?;
        let base = over.ptr.as_ptr() as usize;
        let aligned_base = align_up(base, align);
        let pre = aligned_base - base;
        let mid = size;
        let post = over_size - pre - mid;
        if pre > 0 {
            self.unmap(over.ptr, pre);
        }
        if post > 0 {
            let tail = unsafe { NonNull::new_unchecked((aligned_base + mid) as *mut u8) };
            self.unmap(tail, post);
        }
        let ptr = unsafe { NonNull::new_unchecked(aligned_base as *mut u8) };
        Some(Mapping { ptr, size })
    }

    fn commit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = unsafe { mprotect(ptr.as_ptr() as *mut _, size, PROT_READ | PROT_WRITE) } == 0;
        if ok {
            GLOBAL_STATS.committed.increase(size as i64);
            GLOBAL_STATS.commit_calls.record(1);
        } else {
            warn!("mprotect(commit) failed: {}", errno::errno());
        }
        ok
    }

    fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = unsafe { mprotect(ptr.as_ptr() as *mut _, size, PROT_NONE) } == 0;
        if ok {
            GLOBAL_STATS.committed.decrease(size as i64);
        } else {
            warn!("mprotect(decommit) failed: {}", errno::errno());
        }
        ok
    }

    fn unmap(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let ok = unsafe { munmap(ptr.as_ptr() as *mut _, size) } == 0;
        GLOBAL_STATS.reserved.decrease(size as i64);
        if !ok {
            warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), ptr.as_ptr(), size);
        }
        ok
    }

    fn reset(&self, ptr: NonNull<u8>, size: usize) -> bool {
        if !option_is_enabled(Option_::PageReset) {
            return true;
        }
        let start = align_up(ptr.as_ptr() as usize, self.page_size());
        let end = align_down(ptr.as_ptr() as usize + size, self.page_size());
        if end <= start {
            return true;
        }
        let csize = end - start;
        let err = unsafe { madvise(start as *mut _, csize, MADV_DONTNEED) };
        if err != 0 {
            warn!("madvise(DONTNEED) failed: {}", errno::errno());
            return false;
        }
        GLOBAL_STATS.reset.increase(csize as i64);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_round_trips() {
        let mem = SystemMemory::new();
        let page = mem.page_size();
        assert!(page >= 4096);
        let m = mem.map(page, true).expect("map should succeed");
        assert_eq!(m.ptr.as_ptr() as usize % page, 0);
        assert!(mem.unmap(m.ptr, m.size));
    }

    #[test]
    fn map_aligned_honors_alignment() {
        let mem = SystemMemory::new();
        let align = 1 << 20; // 1 MiB, well above a single OS page
        let m = mem.map_aligned(align, align, true).expect("aligned map should succeed");
        assert_eq!(m.ptr.as_ptr() as usize % align, 0);
        assert!(mem.unmap(m.ptr, m.size));
    }
}
