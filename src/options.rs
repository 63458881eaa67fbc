//! Process-wide configuration knobs.
//!
//! Mirrors the `option_is_enabled(option_xxx)` / `option_get(option_xxx)` calls
//! already referenced (but never defined) in this codebase's OS and span
//! layers. Every knob has a compile-time default; under the `std` feature each
//! one may additionally be set once from an environment variable, read lazily
//! on first use and cached in an atomic so the hot paths never touch `std::env`.

use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Option_ {
    /// Encode local free-list `next` pointers with a per-page cookie and run
    /// extra consistency assertions.
    Secure,
    /// Emit `trace!`-level logging on slow paths (span/page acquisition).
    Verbose,
    /// Decommit a page's non-header OS pages as soon as it becomes fully free.
    PageReset,
    /// Decommit a cached/returned span before it is reused.
    CacheReset,
    /// Number of spans a heap leaves fully committed (no eager decommit) before
    /// applying `PageReset`/`CacheReset`.
    EagerCommitDelay,
}

const OPTION_COUNT: usize = 5;

struct Slot {
    // 0 = unresolved, 1 = resolved-as(value), so we bias stored values by 1 and
    // use 0 as the "not yet consulted" sentinel.
    value: AtomicUsize,
    default: usize,
    env_var: &'static str,
}

static SLOTS: [Slot; OPTION_COUNT] = [
    Slot {
        value: AtomicUsize::new(0),
        default: 0,
        env_var: "CAIMALLOC_SECURE",
    },
    Slot {
        value: AtomicUsize::new(0),
        default: 0,
        env_var: "CAIMALLOC_VERBOSE",
    },
    Slot {
        value: AtomicUsize::new(0),
        default: 1,
        env_var: "CAIMALLOC_PAGE_RESET",
    },
    Slot {
        value: AtomicUsize::new(0),
        default: 1,
        env_var: "CAIMALLOC_CACHE_RESET",
    },
    Slot {
        value: AtomicUsize::new(0),
        default: 16,
        env_var: "CAIMALLOC_EAGER_COMMIT_DELAY",
    },
];

impl Option_ {
    fn index(self) -> usize {
        match self {
            Option_::Secure => 0,
            Option_::Verbose => 1,
            Option_::PageReset => 2,
            Option_::CacheReset => 3,
            Option_::EagerCommitDelay => 4,
        }
    }
}

#[cfg(feature = "std")]
fn read_env(var: &str) -> Option<usize> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

#[cfg(not(feature = "std"))]
fn read_env(_var: &str) -> Option<usize> {
    None
}

/// Read an option's resolved value, consulting the environment at most once.
pub fn option_get(opt: Option_) -> usize {
    let slot = &SLOTS[opt.index()];
    let cached = slot.value.load(Ordering::Relaxed);
    if cached != 0 {
        return cached - 1;
    }
    let resolved = read_env(slot.env_var).unwrap_or(slot.default);
    // Races harmlessly: every racer recomputes the same value from the same
    // immutable default/env-var pair, so a lost CAS just means the store is a
    // no-op duplicate.
    slot.value.store(resolved + 1, Ordering::Relaxed);
    resolved
}

#[inline]
pub fn option_is_enabled(opt: Option_) -> bool {
    option_get(opt) != 0
}

/// Force an option's value for the remainder of the process (used by tests
/// that need deterministic `secure`/`page_reset` behavior).
#[cfg(any(test, feature = "std"))]
pub fn option_set(opt: Option_, value: usize) {
    SLOTS[opt.index()].value.store(value + 1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        assert!(!option_is_enabled(Option_::Secure));
        assert!(option_is_enabled(Option_::PageReset));
        assert_eq!(option_get(Option_::EagerCommitDelay), 16);
    }

    #[test]
    fn set_overrides_default() {
        option_set(Option_::Verbose, 1);
        assert!(option_is_enabled(Option_::Verbose));
        option_set(Option_::Verbose, 0);
        assert!(!option_is_enabled(Option_::Verbose));
    }
}
