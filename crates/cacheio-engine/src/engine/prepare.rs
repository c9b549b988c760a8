//! Request preparation
//!
//! The entry point for one request: resolve its core lines, allocate or
//! evict for the misses, and take the per-line locks, all under the bucket
//! lock set. The fast path never leaves the read side; the miss path
//! upgrades in place; eviction drops the buckets entirely and reruns under
//! the global exclusive lock, re-traversing because the world may have
//! moved while nothing was held.

use super::lookup::traverse;
use super::map::map_req;
use crate::cache::Cache;
use crate::lock::LockStatus;
use crate::policy::EngineCallbacks;
use crate::request::Request;
use cacheio_common::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Prepare a request for its I/O phase.
///
/// On success the request is fully mapped and either holds all its line
/// locks (`Acquired`) or will resume through its queue when the last lock
/// lands (`Pending`). On any error the request's mapping error is set, no
/// locks are held, and the caller decides between pass-through and failure.
pub fn prepare_clines(
    cache: &Cache,
    req: &Arc<Request>,
    cbs: &Arc<dyn EngineCallbacks>,
) -> Result<LockStatus> {
    req.init_map(cache.metadata());
    let buckets = req.sorted_buckets();

    let hb = cache.concurrency().lock_buckets_upgradable(&buckets);
    traverse(cache, req);

    if req.is_fully_mapped() {
        if req.info().re_part_no > 0 {
            let _hbw = hb.upgrade();
            commit_re_part(cache, req);
            return lock_lines(cache, req, cbs);
        }
        return lock_lines(cache, req, cbs);
    }

    if !cache.promotion().should_promote(cache, req) {
        req.set_mapping_error();
        return Err(Error::MappingFailed {
            needed: req.unmapped_count(),
            available: cache.freelist().count(),
        });
    }

    // miss path
    if !cache.partitions().is_enabled(req.part_id()) {
        req.set_mapping_error();
        return Err(Error::PartitionDisabled(req.part_id()));
    }

    if cache.partitions().has_space(req.part_id(), req.unmapped_count()) {
        let hbw = hb.upgrade();
        map_req(cache, req);
        if !req.mapping_error() {
            if req.info().re_part_no > 0 {
                commit_re_part(cache, req);
            }
            return lock_lines(cache, req, cbs);
        }
        // a failed map never retries under the buckets; eviction owns it
        drop(hbw);
    } else {
        drop(hb);
    }

    evict_path(cache, req, cbs)
}

/// The eviction fallback: all bucket locks dropped, global exclusive held.
fn evict_path(
    cache: &Cache,
    req: &Arc<Request>,
    cbs: &Arc<dyn EngineCallbacks>,
) -> Result<LockStatus> {
    let _exclusive = cache.concurrency().lock_exclusive();

    // state may have shifted while no locks were held
    traverse(cache, req);

    if !req.is_fully_mapped() {
        let needed = req.unmapped_count();
        let part_evict = !cache.partitions().has_space(req.part_id(), needed);
        req.state.lock().part_evict = part_evict;

        debug!(
            core = req.core_id(),
            needed, part_evict, "reclaiming lines for request"
        );
        if let Err(err) = cache.eviction().evict(cache, req, needed) {
            req.set_mapping_error();
            return Err(err);
        }

        map_req(cache, req);
        if req.mapping_error() {
            return Err(Error::MappingFailed {
                needed: req.unmapped_count(),
                available: cache.freelist().count(),
            });
        }
    }

    if req.info().re_part_no > 0 {
        commit_re_part(cache, req);
    }
    lock_lines(cache, req, cbs)
}

/// Take the variant's per-line locks. A failed acquisition rolls back to a
/// mapping error without retrying eviction.
fn lock_lines(
    cache: &Cache,
    req: &Arc<Request>,
    cbs: &Arc<dyn EngineCallbacks>,
) -> Result<LockStatus> {
    let rw = cbs.lock_type(cache, req);
    match cache.concurrency().lock_request(req, rw, cbs.clone()) {
        Ok(status) => Ok(status),
        Err(_) => {
            req.set_mapping_error();
            Err(Error::LockNotAcquired)
        }
    }
}

/// Move hit lines flagged during lookup into the request's partition.
/// Caller holds write locks on the request's buckets or the exclusive lock.
fn commit_re_part(cache: &Cache, req: &Request) {
    let mut state = req.state.lock();
    for entry in &mut state.map {
        if !entry.re_part {
            continue;
        }
        if let Some(from) = cache.metadata().partition_id(entry.coll_idx) {
            if from != req.part_id() {
                let _access = cache.concurrency().collision_shared(entry.coll_idx);
                cache
                    .partitions()
                    .move_line(cache.metadata(), from, req.part_id(), entry.coll_idx);
            }
        }
        entry.re_part = false;
    }
}
