//! Mapping: assigning cache lines to a request's misses
//!
//! `map_req` and `unwind_map` form a transactional pair: any failure while
//! assigning lines rolls every line assigned so far back to the freelist,
//! leaving metadata as it was before the attempt (modulo eviction already
//! committed by the caller).
//!
//! Callers hold write locks on the request's buckets or the global
//! exclusive lock.

use super::lookup::{lookup_entry, patch_req_info, update_req_info};
use crate::cache::Cache;
use crate::request::{LookupStatus, ReqState, Request};
use cacheio_common::{CacheLine, INVALID_LINE};

/// Take ownership of `line` for entry `idx`: splice it into the entry's
/// bucket, link it into the request's partition and run the insertion
/// hooks.
fn attach_line(
    cache: &Cache,
    req: &Request,
    state: &mut ReqState,
    idx: usize,
    line: CacheLine,
    status: LookupStatus,
) {
    let entry = &mut state.map[idx];
    let _access = cache.concurrency().collision_shared(line);
    cache
        .metadata()
        .add_to_collision(req.core_id(), entry.core_line, entry.hash, line);
    cache.partitions().add(cache.metadata(), req.part_id(), line);
    entry.coll_idx = line;
    entry.status = status;

    cache.cleaning().init_cache_block(cache, line);
    cache.eviction().init_cache_line(line);
    cache.eviction().set_hot(line);
}

/// Roll back a partially mapped request.
///
/// Every line this attempt inserted or remapped is invalidated (no flush)
/// and thereby unhooked and returned to the freelist; its entry reverts to
/// a miss. Hits and misses are untouched.
pub(crate) fn unwind_map(cache: &Cache, state: &mut ReqState) {
    let full = cache.metadata().full_range();
    for entry in &mut state.map {
        if matches!(entry.status, LookupStatus::Inserted | LookupStatus::Remapped) {
            let line = entry.coll_idx;
            {
                let _access = cache.concurrency().collision_shared(line);
                cache.set_cache_line_invalid_no_flush(full, line);
            }
            entry.status = LookupStatus::Miss;
            entry.coll_idx = INVALID_LINE;
        }
    }
}

/// Assign cache lines to every unmapped entry of the request.
///
/// Entries are re-resolved first; the collision table may have changed
/// since the traverse that found them missing. Remaining misses pop the
/// freelist. Any failure sets the request's mapping error and unwinds.
pub fn map_req(cache: &Cache, req: &Request) {
    let unmapped = req.unmapped_count();
    if unmapped == 0 {
        return;
    }
    if u64::from(unmapped) > cache.freelist().count() {
        req.set_mapping_error();
        return;
    }

    let mut state = req.state.lock();
    state.info.clear();
    for i in 0..state.map.len() {
        lookup_entry(cache, req.core_id(), &mut state.map[i]);
        if state.map[i].status == LookupStatus::Hit {
            update_req_info(cache, req, &mut state, i);
            continue;
        }
        match cache.freelist().pop() {
            Some(line) => {
                attach_line(cache, req, &mut state, i, line, LookupStatus::Inserted);
                update_req_info(cache, req, &mut state, i);
            }
            None => {
                state.mapping_error = true;
                unwind_map(cache, &mut state);
                break;
            }
        }
    }

    if !state.mapping_error {
        drop(state);
        cache.promotion().purge(cache, req);
    }
}

/// Hand a reclaimed line straight to entry `idx` of the request.
///
/// Eviction policies use this to remap victims without a freelist
/// round-trip. Caller holds the global exclusive lock (or write locks on
/// both buckets involved).
pub fn map_cache_line(cache: &Cache, req: &Request, idx: u32, line: CacheLine) {
    let mut state = req.state.lock();
    debug_assert_eq!(state.map[idx as usize].status, LookupStatus::Miss);
    attach_line(cache, req, &mut state, idx as usize, line, LookupStatus::Remapped);
    patch_req_info(cache, &mut state, idx as usize);
}
