//! Cache statistics
//!
//! Request and block counters in the classification the engine variants
//! report: a prepared request is a full hit, a partial hit, or a full miss
//! per direction. Internal requests (cleaner traffic) are not counted.

use crate::request::Request;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub read_full_hits: AtomicU64,
    pub read_partial_hits: AtomicU64,
    pub read_full_misses: AtomicU64,
    pub write_full_hits: AtomicU64,
    pub write_partial_hits: AtomicU64,
    pub write_full_misses: AtomicU64,
    pub read_bytes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub sequential_requests: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_full_hits: u64,
    pub read_partial_hits: u64,
    pub read_full_misses: u64,
    pub write_full_hits: u64,
    pub write_partial_hits: u64,
    pub write_full_misses: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub sequential_requests: u64,
}

impl CacheStats {
    /// Classify a prepared request into the hit/miss counters.
    pub fn update_request(&self, req: &Request) {
        if req.is_internal() {
            return;
        }
        let info = req.info();
        let count = req.core_line_count();
        let write = req.rw().is_write();

        let counter = if info.hit_no == count {
            if write {
                &self.write_full_hits
            } else {
                &self.read_full_hits
            }
        } else if info.hit_no > 0 || info.invalid_no > 0 {
            if write {
                &self.write_partial_hits
            } else {
                &self.read_partial_hits
            }
        } else if write {
            &self.write_full_misses
        } else {
            &self.read_full_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if req.is_sequential() {
            self.sequential_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account the request's volume.
    pub fn update_blocks(&self, req: &Request) {
        if req.is_internal() {
            return;
        }
        if req.rw().is_write() {
            self.write_bytes.fetch_add(req.bytes(), Ordering::Relaxed);
        } else {
            self.read_bytes.fetch_add(req.bytes(), Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_full_hits: self.read_full_hits.load(Ordering::Relaxed),
            read_partial_hits: self.read_partial_hits.load(Ordering::Relaxed),
            read_full_misses: self.read_full_misses.load(Ordering::Relaxed),
            write_full_hits: self.write_full_hits.load(Ordering::Relaxed),
            write_partial_hits: self.write_partial_hits.load(Ordering::Relaxed),
            write_full_misses: self.write_full_misses.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            sequential_requests: self.sequential_requests.load(Ordering::Relaxed),
        }
    }

    /// Fraction of counted requests that were full hits.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let s = self.snapshot();
        let hits = s.read_full_hits + s.write_full_hits;
        let total = hits
            + s.read_partial_hits
            + s.write_partial_hits
            + s.read_full_misses
            + s.write_full_misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}
