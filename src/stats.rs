//! Best-effort allocator statistics (ambient; nothing on an allocation's hot
//! path depends on these values being accurate under race). Layout follows
//! this codebase's own `Stats`/`StatCount` types, ported from the raw-pointer
//! update functions this module used to have to `&self` methods.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        let mut old_peak = self.peak.load(Ordering::Relaxed);
        while current > old_peak {
            match self.peak.compare_exchange_weak(
                old_peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old_peak = actual,
            }
        }
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> Self {
        StatCounter {
            total: AtomicI64::new(0),
            count: AtomicI64::new(0),
        }
    }

    pub fn record(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide stats aggregate; one instance, shared across heaps.
pub struct Stats {
    pub spans: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub spans_abandoned: StatCount,
    pub mmap_calls: StatCounter,
    pub commit_calls: StatCounter,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub searches: StatCounter,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            spans: StatCount::new(),
            pages: StatCount::new(),
            reserved: StatCount::new(),
            committed: StatCount::new(),
            reset: StatCount::new(),
            spans_abandoned: StatCount::new(),
            mmap_calls: StatCounter::new(),
            commit_calls: StatCounter::new(),
            threads: StatCount::new(),
            huge: StatCount::new(),
            malloc: StatCount::new(),
            searches: StatCounter::new(),
        }
    }
}

pub static GLOBAL_STATS: Stats = Stats::new();
