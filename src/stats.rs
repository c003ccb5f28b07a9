use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters, safe to bump from readers and the writer alike.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    records_read: AtomicU64,
    records_written: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl StatsCollector {
    pub fn inc_records_read(&self, n: u64) {
        self.records_read.fetch_add(n, Ordering::SeqCst);
    }

    pub fn inc_records_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::SeqCst);
    }

    pub fn inc_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::SeqCst);
    }

    pub fn inc_cache_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            records_read: self.records_read.load(Ordering::SeqCst),
            records_written: self.records_written.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            cache_misses: self.cache_misses.load(Ordering::SeqCst),
        }
    }
}

/// A point-in-time snapshot of collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Records materialized from cache or disk.
    pub records_read: u64,
    /// Records appended by commits.
    pub records_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
