//! Lookup, traverse and the post-resume check
//!
//! All three walk collision chains and therefore run with the request's
//! hash buckets locked (read side suffices) or under the global exclusive
//! lock.

use crate::cache::Cache;
use crate::request::{LookupStatus, MapEntry, ReqState, Request};
use cacheio_common::{CoreId, Error, INVALID_LINE, Result};

/// Resolve one map entry against the collision table.
///
/// Walks the chain of the entry's recorded bucket; on a `(core, core line)`
/// match the entry becomes a hit, otherwise it stays a miss with no line
/// assigned.
pub(crate) fn lookup_entry(cache: &Cache, core_id: CoreId, entry: &mut MapEntry) {
    let meta = cache.metadata();
    entry.status = LookupStatus::Miss;
    entry.coll_idx = INVALID_LINE;
    entry.invalid = false;
    entry.re_part = false;

    let mut line = meta.collision_head(entry.hash);
    while line != INVALID_LINE {
        if meta.core_info(line) == Some((core_id, entry.core_line)) {
            entry.status = LookupStatus::Hit;
            entry.coll_idx = line;
            return;
        }
        line = meta.collision_next(line);
    }
}

/// True when both entries are mapped and physically adjacent.
fn phys_contiguous(cache: &Cache, prev: &MapEntry, cur: &MapEntry) -> bool {
    prev.status.is_mapped()
        && cur.status.is_mapped()
        && cache.metadata().lg2phy(prev.coll_idx) + 1 == cache.metadata().lg2phy(cur.coll_idx)
}

/// Fold entry `idx` into the request's aggregate info.
///
/// Hits are classified by valid-bitmap coverage of the request's sector
/// range, dirty coverage, and partition residency. Remapped entries are not
/// counted here; [`patch_req_info`] handles them because their neighbors
/// may already have been counted.
pub(crate) fn update_req_info(cache: &Cache, req: &Request, state: &mut ReqState, idx: usize) {
    let meta = cache.metadata();
    let entry = state.map[idx];
    match entry.status {
        LookupStatus::Hit => {
            let range = req.entry_sector_range(idx as u32);
            if meta.test_valid_range(entry.coll_idx, range) {
                state.info.hit_no += 1;
            } else {
                state.info.invalid_no += 1;
            }
            if meta.any_dirty_range(entry.coll_idx, range) {
                state.info.dirty_any += 1;
                if meta.all_dirty_range(entry.coll_idx, range) {
                    state.info.dirty_all += 1;
                }
            }
            if meta.partition_id(entry.coll_idx) != Some(req.part_id()) {
                state.map[idx].re_part = true;
                state.info.re_part_no += 1;
            }
        }
        LookupStatus::Inserted => state.info.insert_no += 1,
        LookupStatus::Remapped | LookupStatus::Miss => {}
    }

    if idx > 0 && phys_contiguous(cache, &state.map[idx - 1], &state.map[idx]) {
        state.info.seq_no += 1;
    }
}

/// Info update for an entry remapped out of order: count the insert and
/// re-examine contiguity with both neighbors.
pub(crate) fn patch_req_info(cache: &Cache, state: &mut ReqState, idx: usize) {
    state.info.insert_no += 1;
    if idx > 0 && phys_contiguous(cache, &state.map[idx - 1], &state.map[idx]) {
        state.info.seq_no += 1;
    }
    if idx + 1 < state.map.len() && phys_contiguous(cache, &state.map[idx], &state.map[idx + 1]) {
        state.info.seq_no += 1;
    }
}

/// Walk the request's core-line range, resolving every entry and
/// accumulating fresh aggregate info. Hits are reported hot to the eviction
/// policy.
pub fn traverse(cache: &Cache, req: &Request) {
    let mut state = req.state.lock();
    state.info.clear();
    for i in 0..state.map.len() {
        lookup_entry(cache, req.core_id(), &mut state.map[i]);
        if state.map[i].status == LookupStatus::Hit {
            cache.eviction().set_hot(state.map[i].coll_idx);
            update_req_info(cache, req, &mut state, i);
        }
    }
}

/// Re-examine a prepared request's mapping after a suspension.
///
/// Every mapped entry must still resolve to the same cache line it was
/// given. Entries that no longer match are flagged invalid and the request
/// must not proceed to I/O.
pub fn check(cache: &Cache, req: &Request) -> Result<()> {
    let mut state = req.state.lock();
    let mut consistent = true;
    for i in 0..state.map.len() {
        let entry = state.map[i];
        if !entry.status.is_mapped() {
            continue;
        }
        let owner = if entry.coll_idx == INVALID_LINE {
            None
        } else {
            cache.metadata().core_info(entry.coll_idx)
        };
        if owner != Some((req.core_id(), entry.core_line)) {
            state.map[i].invalid = true;
            consistent = false;
        }
    }
    if consistent {
        Ok(())
    } else {
        Err(Error::InvalidMapping)
    }
}
