//! The request engine
//!
//! Preparation runs in [`prepare`]; the lookup/traverse/check primitives in
//! [`lookup`]; mapping and its unwind in [`map`]. This module carries the
//! paths around them: dispatch, the post-resume refresh pass,
//! clean-before-reuse, error accounting and the valid/dirty commit helpers
//! engine variants call after their I/O lands.

pub mod lookup;
pub mod map;
pub mod prepare;

pub use lookup::{check, traverse};
pub use map::{map_cache_line, map_req};
pub use prepare::prepare_clines;

use crate::cache::Cache;
use crate::policy::CleanerAttribs;
use crate::request::{IoPhase, Request};
use cacheio_common::{CacheLine, Result};
use std::sync::Arc;
use tracing::{debug, error as log_error, warn};

/// Run a request's current I/O interface. Workers call this for every
/// request they pop.
pub fn dispatch(cache: &Arc<Cache>, req: &Arc<Request>) {
    match req.io_phase() {
        IoPhase::Refreshing(_) => refresh(cache, req),
        IoPhase::Normal(io) => {
            if req.rw().is_write() {
                io.write(cache, req);
            } else {
                io.read(cache, req);
            }
        }
    }
}

/// Line-lock grant continuation: install the refresh interface and requeue
/// the request at the front of its queue.
pub fn on_resume(req: &Arc<Request>) {
    req.resume();
}

/// The refresh pass. Metadata may have shifted while the request waited for
/// its line locks, so re-validate the mapping before touching data. On a
/// consistent mapping the saved interface is restored and dispatched; on a
/// stale one the request fails, its line locks are released and completion
/// fires.
fn refresh(cache: &Arc<Cache>, req: &Arc<Request>) {
    let checked = {
        let buckets = req.sorted_buckets();
        let _hb = cache.concurrency().lock_buckets_read(&buckets);
        lookup::check(cache, req)
    };
    match checked {
        Ok(()) => {
            let io = req.restore_io();
            if req.rw().is_write() {
                io.write(cache, req);
            } else {
                io.read(cache, req);
            }
        }
        Err(err) => {
            debug!(
                core = req.core_id(),
                first_line = req.core_line_first(),
                "mapping changed while request was suspended"
            );
            cache.concurrency().unlock_request(req);
            req.complete(Err(err));
        }
    }
}

/// Flush the request's dirty hit lines before the variant reuses them.
///
/// Builds the cleaner work order: a getter yielding the cache line of each
/// dirty hit in map order. On cleaner success the request's dirty counters
/// are zeroed and it re-enters at the front of its queue; on failure it
/// completes with the cleaner's error, line locks released.
pub fn clean(cache: &Arc<Cache>, req: &Arc<Request>) {
    let dirty_lines: Vec<CacheLine> = {
        let state = req.state.lock();
        state
            .map
            .iter()
            .filter(|e| e.status == crate::request::LookupStatus::Hit)
            .filter(|e| cache.metadata().any_dirty(e.coll_idx))
            .map(|e| e.coll_idx)
            .collect()
    };
    if dirty_lines.is_empty() {
        return;
    }

    let count = dirty_lines.len() as u32;
    let mut pending = dirty_lines.into_iter();
    let cache_cb = cache.clone();
    let req_cb = req.clone();
    let attribs = CleanerAttribs {
        getter: Box::new(move || pending.next()),
        count,
        complete: Box::new(move |result: Result<()>| match result {
            Ok(()) => {
                {
                    let mut state = req_cb.state.lock();
                    state.info.dirty_any = 0;
                    state.info.dirty_all = 0;
                }
                req_cb.queue().push_front(req_cb.clone(), true);
            }
            Err(err) => {
                warn!(core = req_cb.core_id(), %err, "cleaning before reuse failed");
                cache_cb.concurrency().unlock_request(&req_cb);
                req_cb.complete(Err(err));
            }
        }),
        // the request already holds its line locks
        lock_cacheline: false,
        queue: req.queue().clone(),
    };
    cache.cleaner().fire(cache, attribs);
}

/// Record an I/O error against the cache. Counts toward the fallback
/// pass-through threshold; `stop_cache` latches the cache failed.
pub fn error(cache: &Cache, req: &Request, stop_cache: bool, msg: &str) {
    cache.fallback_pt().report_error();
    if stop_cache {
        cache.set_failed();
        log_error!(core = req.core_id(), addr = req.addr(), "{msg}");
    } else {
        warn!(core = req.core_id(), addr = req.addr(), "{msg}");
    }
}

/// Mark the sectors the request covers valid on every mapped line. Engine
/// variants call this once the cache-device write that backfills the lines
/// has completed.
pub fn set_valid_map_info(cache: &Cache, req: &Request) {
    let state = req.state.lock();
    for (i, entry) in state.map.iter().enumerate() {
        if entry.status.is_mapped() {
            cache
                .metadata()
                .set_valid_range(entry.coll_idx, req.entry_sector_range(i as u32));
        }
    }
}

/// Mark the sectors the request covers dirty on every mapped line.
/// Write-back variants call this when they complete without flushing.
pub fn set_dirty_map_info(cache: &Cache, req: &Request) {
    let state = req.state.lock();
    for (i, entry) in state.map.iter().enumerate() {
        if entry.status.is_mapped() {
            cache
                .metadata()
                .set_dirty_range(entry.coll_idx, req.entry_sector_range(i as u32));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::lock::LockStatus;
    use crate::request::LookupStatus;
    use cacheio_common::{Error, IoDir, SectorRange};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_dispatch_runs_normal_interface() {
        let h = harness(16);
        let (req, io, _probe) = h.request(3, 1, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);

        dispatch(&h.cache, &req);
        assert_eq!(io.reads.load(Ordering::SeqCst), 1);
        assert_eq!(io.writes.load(Ordering::SeqCst), 0);
        h.cache.concurrency().unlock_request(&req);
    }

    // Scenario: dirty hits flushed before reuse. The cleaner sees exactly
    // the dirty lines in map order, then the request re-enters at the front
    // of its queue with its dirty counters cleared.
    #[test]
    fn test_clean_fires_getter_in_map_order() {
        let h = harness(16);
        for i in 0..4 {
            h.insert_valid(10 + i, 1);
        }
        let dirty_a = h.line_of(11).unwrap();
        let dirty_b = h.line_of(13).unwrap();
        let full = h.cache.metadata().full_range();
        h.cache.metadata().set_dirty_range(dirty_a, full);
        h.cache.metadata().set_dirty_range(dirty_b, full);

        let (req, _io, probe) = h.request(10, 4, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);
        let info = req.info();
        assert_eq!(info.hit_no, 4);
        assert_eq!(info.dirty_any, 2);
        assert_eq!(info.dirty_all, 2);

        clean(&h.cache, &req);

        let fired = h.cleaner.fired.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0], vec![dirty_a, dirty_b]);
        drop(fired);

        let info = req.info();
        assert_eq!(info.dirty_any, 0);
        assert_eq!(info.dirty_all, 0);
        assert!(!probe.completed());

        // the request went back to the front of its queue
        let next = h.queue.pop().unwrap();
        assert!(std::sync::Arc::ptr_eq(&next, &req));
        h.cache.concurrency().unlock_request(&req);
    }

    #[test]
    fn test_clean_failure_completes_request() {
        let h = harness(16);
        h.insert_valid(5, 1);
        let line = h.line_of(5).unwrap();
        let full = h.cache.metadata().full_range();
        h.cache.metadata().set_dirty_range(line, full);

        let (req, _io, probe) = h.request(5, 1, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);

        h.cleaner.fail.store(true, Ordering::SeqCst);
        clean(&h.cache, &req);

        assert!(probe.completed_err());
        assert!(!h.cache.concurrency().is_line_locked(line));
        assert!(h.queue.is_empty());
    }

    #[test]
    fn test_clean_without_dirty_lines_is_noop() {
        let h = harness(16);
        h.insert_valid(5, 1);
        let (req, _io, _probe) = h.request(5, 1, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);

        clean(&h.cache, &req);
        assert!(h.cleaner.fired.lock().is_empty());
        h.cache.concurrency().unlock_request(&req);
    }

    // Scenario: resume-refresh mismatch. A suspended request's line gets
    // invalidated; upon resume the refresh check fails, the request
    // completes with the mapping error and its locks are gone.
    #[test]
    fn test_refresh_detects_stale_mapping() {
        let h = harness(16);
        h.insert_valid(42, 1);
        let line = h.line_of(42).unwrap();

        let (holder, _hio, _hprobe) = h.request(42, 1, IoDir::Write);
        assert_eq!(h.prepare(&holder).unwrap(), LockStatus::Acquired);

        let (req, io, probe) = h.request(42, 1, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Pending);

        // the hosting line is torn away while the request waits
        {
            let _access = h.cache.concurrency().collision_exclusive(line);
            h.cache
                .set_cache_line_invalid_no_flush(h.cache.metadata().full_range(), line);
        }

        h.cache.concurrency().unlock_request(&holder);
        let resumed = h.queue.pop().expect("request resumed to queue front");
        assert!(std::sync::Arc::ptr_eq(&resumed, &req));

        dispatch(&h.cache, &resumed);
        assert!(matches!(
            &*probe.0.lock(),
            Some(Err(Error::InvalidMapping))
        ));
        assert_eq!(io.reads.load(Ordering::SeqCst), 0);
        assert!(!h.cache.concurrency().is_line_locked(line));
        assert!(req.map_entry(0).invalid);
    }

    #[test]
    fn test_refresh_restores_interface_on_consistent_mapping() {
        let h = harness(16);
        h.insert_valid(7, 1);

        let (holder, _hio, _hprobe) = h.request(7, 1, IoDir::Write);
        assert_eq!(h.prepare(&holder).unwrap(), LockStatus::Acquired);
        let (req, io, probe) = h.request(7, 1, IoDir::Read);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Pending);

        h.cache.concurrency().unlock_request(&holder);
        let resumed = h.queue.pop().unwrap();

        dispatch(&h.cache, &resumed);
        // check passed: the saved interface ran and the request still holds
        // its lock until its I/O completes
        assert_eq!(io.reads.load(Ordering::SeqCst), 1);
        assert!(!probe.completed());
        assert!(matches!(req.io_phase(), crate::request::IoPhase::Normal(_)));
        h.cache.concurrency().unlock_request(&req);
    }

    #[test]
    fn test_error_trips_fallback_and_latches_failure() {
        let config = cacheio_common::CacheConfig {
            cache_line_count: 16,
            fallback_pt_error_threshold: 2,
            ..cacheio_common::CacheConfig::default()
        };
        let cache = crate::cache::CacheBuilder::new(config).build().unwrap();
        let queue = std::sync::Arc::new(crate::queue::RequestQueue::unkicked());
        let req = cache
            .new_request(
                0,
                0,
                IoDir::Read,
                0,
                4096,
                queue,
                std::sync::Arc::new(crate::policy::NullIo),
                Box::new(|_| {}),
            )
            .unwrap();

        error(&cache, &req, false, "core I/O failed");
        assert!(!cache.fallback_pt().is_active());
        error(&cache, &req, false, "core I/O failed");
        assert!(cache.fallback_pt().is_active());
        assert!(!cache.is_failed());

        error(&cache, &req, true, "cache device gone");
        assert!(cache.is_failed());
    }

    #[test]
    fn test_valid_and_dirty_map_commit() {
        let h = harness(16);
        let (req, _io, _probe) = h.request(3, 2, IoDir::Write);
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);
        assert_eq!(req.map_entry(0).status, LookupStatus::Inserted);

        set_valid_map_info(&h.cache, &req);
        set_dirty_map_info(&h.cache, &req);

        let meta = h.cache.metadata();
        for i in 0..2 {
            let line = req.map_entry(i).coll_idx;
            assert!(meta.test_valid_range(line, meta.full_range()));
            assert!(meta.all_dirty_range(line, meta.full_range()));
        }
        h.cache.concurrency().unlock_request(&req);
    }

    #[test]
    fn test_partial_write_commits_partial_sectors() {
        let h = harness(16);
        // sectors 2..=5 of one line
        let io = std::sync::Arc::new(RecordingIo::default());
        let probe = CompletionProbe::default();
        let req = h
            .cache
            .new_request(
                0,
                0,
                IoDir::Write,
                9 * 4096 + 1024,
                2048,
                h.queue.clone(),
                io,
                probe.callback(),
            )
            .unwrap();
        assert_eq!(h.prepare(&req).unwrap(), LockStatus::Acquired);
        set_valid_map_info(&h.cache, &req);

        let meta = h.cache.metadata();
        let line = req.map_entry(0).coll_idx;
        assert!(meta.test_valid_range(line, SectorRange::new(2, 5)));
        assert!(!meta.test_valid_range(line, SectorRange::new(1, 1)));
        assert!(!meta.test_valid_range(line, SectorRange::new(6, 6)));
        h.cache.concurrency().unlock_request(&req);
    }
}
