//! Concurrency manager: the three locking tiers
//!
//! Lock order, outermost first:
//!
//! 1. Hash-bucket locks, taken as a sorted set per request. The pipeline
//!    takes them upgradable so the whole set can be promoted to write
//!    atomically; observers take plain read.
//! 2. Per-cache-line read/write locks. Asynchronous: an unavailable line
//!    enqueues a waiter and the request suspends, to be resumed when the
//!    last line is granted.
//! 3. The global metadata exclusive lock, mutually exclusive with every
//!    bucket lock. Held only around the eviction/remap path. Bucket lockers
//!    hold its read side, the evictor its write side.
//!
//! Collision shared-access shards sit below the bucket tier and guard
//! per-line collision membership changes (and the LRU state threaded
//! through the same slots).

use crate::policy::EngineCallbacks;
use crate::request::Request;
use cacheio_common::{CacheLine, Error, Result};
use parking_lot::{
    Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const COLLISION_SHARDS: usize = 64;

/// Kind of per-line lock an engine variant wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    #[default]
    None,
    Read,
    Write,
}

/// Outcome of a line-lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// All lines locked; the caller proceeds synchronously.
    Acquired,
    /// At least one line is contended. The request now belongs to the lock
    /// manager and resumes through its queue once the last grant lands.
    Pending,
}

#[derive(Default)]
struct LineLockState {
    writer: bool,
    readers: u32,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    req: Arc<Request>,
    rw: LockType,
}

pub struct ConcurrencyManager {
    global: RwLock<()>,
    buckets: Vec<RwLock<()>>,
    shards: [RwLock<()>; COLLISION_SHARDS],
    lines: Vec<Mutex<LineLockState>>,
}

/// Read guards over a request's bucket set.
pub struct BucketReadGuards<'a> {
    _global: RwLockReadGuard<'a, ()>,
    _buckets: Vec<RwLockReadGuard<'a, ()>>,
}

/// Upgradable guards over a request's bucket set.
pub struct BucketUpgradableGuards<'a> {
    global: RwLockReadGuard<'a, ()>,
    buckets: Vec<RwLockUpgradableReadGuard<'a, ()>>,
}

/// Write guards over a request's bucket set.
pub struct BucketWriteGuards<'a> {
    _global: RwLockReadGuard<'a, ()>,
    _buckets: Vec<RwLockWriteGuard<'a, ()>>,
}

impl<'a> BucketUpgradableGuards<'a> {
    /// Promote the whole set to write locks. Buckets are upgraded in the
    /// sorted order they were acquired in.
    #[must_use]
    pub fn upgrade(self) -> BucketWriteGuards<'a> {
        BucketWriteGuards {
            _global: self.global,
            _buckets: self
                .buckets
                .into_iter()
                .map(RwLockUpgradableReadGuard::upgrade)
                .collect(),
        }
    }
}

/// The global metadata exclusive lock.
pub struct ExclusiveGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Shared collision-access guard for one line.
pub struct CollisionGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive collision-access guard for one line.
pub struct CollisionExclusiveGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl ConcurrencyManager {
    pub fn new(line_count: u32, bucket_count: u32) -> Self {
        Self {
            global: RwLock::new(()),
            buckets: (0..bucket_count).map(|_| RwLock::new(())).collect(),
            shards: std::array::from_fn(|_| RwLock::new(())),
            lines: (0..line_count).map(|_| Mutex::new(LineLockState::default())).collect(),
        }
    }

    // --- bucket tier ---

    /// Read-lock a sorted, deduplicated bucket set.
    pub fn lock_buckets_read(&self, buckets: &[u32]) -> BucketReadGuards<'_> {
        debug_assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        BucketReadGuards {
            _global: self.global.read(),
            _buckets: buckets
                .iter()
                .map(|&b| self.buckets[b as usize].read())
                .collect(),
        }
    }

    /// Upgradable-lock a sorted, deduplicated bucket set.
    pub fn lock_buckets_upgradable(&self, buckets: &[u32]) -> BucketUpgradableGuards<'_> {
        debug_assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        BucketUpgradableGuards {
            global: self.global.read(),
            buckets: buckets
                .iter()
                .map(|&b| self.buckets[b as usize].upgradable_read())
                .collect(),
        }
    }

    /// Take the global metadata exclusive lock. Callers must have dropped
    /// every bucket guard first; the type system enforces nothing here, the
    /// pipeline's structure does.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard {
            _guard: self.global.write(),
        }
    }

    // --- collision shared access ---

    pub fn collision_shared(&self, line: CacheLine) -> CollisionGuard<'_> {
        CollisionGuard {
            _guard: self.shards[line as usize % COLLISION_SHARDS].read(),
        }
    }

    pub fn collision_exclusive(&self, line: CacheLine) -> CollisionExclusiveGuard<'_> {
        CollisionExclusiveGuard {
            _guard: self.shards[line as usize % COLLISION_SHARDS].write(),
        }
    }

    // --- per-line lock tier ---

    fn can_grant(state: &LineLockState, rw: LockType) -> bool {
        if !state.waiters.is_empty() {
            return false;
        }
        match rw {
            LockType::None => true,
            LockType::Read => !state.writer,
            LockType::Write => !state.writer && state.readers == 0,
        }
    }

    fn apply_grant(state: &mut LineLockState, rw: LockType) {
        match rw {
            LockType::None => {}
            LockType::Read => state.readers += 1,
            LockType::Write => state.writer = true,
        }
    }

    /// Acquire `rw` locks on every mapped line of the request, in map-entry
    /// order.
    ///
    /// Grants are all-or-nothing from the request's point of view: lines
    /// locked synchronously stay locked while the rest wait, and the request
    /// resumes (via `cbs.resume`) only when the final line is granted. The
    /// grant countdown carries one extra guard token held by this thread so
    /// a racing release cannot fire the resume before `Pending` is returned.
    pub fn lock_request(
        &self,
        req: &Arc<Request>,
        rw: LockType,
        cbs: Arc<dyn EngineCallbacks>,
    ) -> Result<LockStatus> {
        if rw == LockType::None {
            req.state.lock().lock_rw = LockType::None;
            return Ok(LockStatus::Acquired);
        }

        let lines = req.mapped_lines();
        if lines.is_empty() {
            return Err(Error::internal("locking a request with no mapped lines"));
        }

        req.state.lock().lock_rw = rw;
        *req.resume_cbs.lock() = Some(cbs);
        req.lock_remaining
            .store(lines.len() as u32 + 1, Ordering::SeqCst);

        for &line in &lines {
            let mut state = self.lines[line as usize].lock();
            if Self::can_grant(&state, rw) {
                Self::apply_grant(&mut state, rw);
                drop(state);
                req.lock_remaining.fetch_sub(1, Ordering::SeqCst);
            } else {
                state.waiters.push_back(Waiter {
                    req: req.clone(),
                    rw,
                });
            }
        }

        // Drop the guard token. Whoever brings the counter to zero owns the
        // continuation; if that is us, every line was granted along the way.
        if req.lock_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            req.resume_cbs.lock().take();
            Ok(LockStatus::Acquired)
        } else {
            Ok(LockStatus::Pending)
        }
    }

    /// Release the request's line locks and hand freed lines to waiters.
    /// Idempotent; a request that never locked is a no-op.
    pub fn unlock_request(&self, req: &Request) {
        let rw = {
            let mut state = req.state.lock();
            std::mem::replace(&mut state.lock_rw, LockType::None)
        };
        if rw == LockType::None {
            return;
        }

        for line in req.mapped_lines() {
            let mut resumed = Vec::new();
            {
                let mut state = self.lines[line as usize].lock();
                match rw {
                    LockType::Read => state.readers -= 1,
                    LockType::Write => state.writer = false,
                    LockType::None => unreachable!(),
                }
                Self::grant_waiters(&mut state, &mut resumed);
            }
            // Resumes run outside the line mutex; they take the request's
            // state lock and its queue lock.
            for waiter in resumed {
                let cbs = waiter.resume_cbs.lock().take();
                if let Some(cbs) = cbs {
                    cbs.resume(&waiter);
                }
            }
        }
    }

    fn grant_waiters(state: &mut LineLockState, resumed: &mut Vec<Arc<Request>>) {
        while let Some(front) = state.waiters.front() {
            let grantable = match front.rw {
                LockType::Read => !state.writer,
                LockType::Write => !state.writer && state.readers == 0,
                LockType::None => true,
            };
            if !grantable {
                break;
            }
            let waiter = state.waiters.pop_front().expect("front exists");
            Self::apply_grant(state, waiter.rw);
            if waiter.req.lock_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                resumed.push(waiter.req);
            }
            if state.writer {
                break;
            }
        }
    }

    /// Whether any request holds or awaits the line. Used by eviction
    /// policies to skip busy victims.
    #[must_use]
    pub fn is_line_locked(&self, line: CacheLine) -> bool {
        let state = self.lines[line as usize].lock();
        state.writer || state.readers > 0 || !state.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::policy::{DefaultCallbacks, NullIo};
    use crate::queue::RequestQueue;
    use crate::request::{IoPhase, LookupStatus};
    use cacheio_common::{IoDir, MetadataLayout};

    fn mapped_request(queue: &Arc<RequestQueue>, lines: &[CacheLine], rw: IoDir) -> Arc<Request> {
        let meta = Metadata::new(64, 8, 8, MetadataLayout::Sequential);
        let req = Request::new(
            0,
            0,
            rw,
            0,
            4096 * lines.len() as u64,
            4096,
            8,
            queue.clone(),
            Arc::new(NullIo),
            Box::new(|_| {}),
        )
        .unwrap();
        req.init_map(&meta);
        {
            let mut state = req.state.lock();
            for (i, &line) in lines.iter().enumerate() {
                state.map[i].coll_idx = line;
                state.map[i].status = LookupStatus::Hit;
            }
        }
        req
    }

    fn cbs() -> Arc<dyn EngineCallbacks> {
        Arc::new(DefaultCallbacks)
    }

    #[test]
    fn test_uncontended_write_lock() {
        let mgr = ConcurrencyManager::new(64, 8);
        let queue = Arc::new(RequestQueue::unkicked());
        let req = mapped_request(&queue, &[1, 2, 3], IoDir::Write);

        let status = mgr.lock_request(&req, LockType::Write, cbs()).unwrap();
        assert_eq!(status, LockStatus::Acquired);
        assert!(mgr.is_line_locked(2));

        mgr.unlock_request(&req);
        assert!(!mgr.is_line_locked(2));
        // second unlock is a no-op
        mgr.unlock_request(&req);
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let mgr = ConcurrencyManager::new(64, 8);
        let queue = Arc::new(RequestQueue::unkicked());
        let r1 = mapped_request(&queue, &[5], IoDir::Read);
        let r2 = mapped_request(&queue, &[5], IoDir::Read);
        let w = mapped_request(&queue, &[5], IoDir::Write);

        assert_eq!(
            mgr.lock_request(&r1, LockType::Read, cbs()).unwrap(),
            LockStatus::Acquired
        );
        assert_eq!(
            mgr.lock_request(&r2, LockType::Read, cbs()).unwrap(),
            LockStatus::Acquired
        );
        assert_eq!(
            mgr.lock_request(&w, LockType::Write, cbs()).unwrap(),
            LockStatus::Pending
        );

        mgr.unlock_request(&r1);
        assert!(queue.is_empty());
        mgr.unlock_request(&r2);

        // last reader out grants the writer, which resumes through its queue
        let resumed = queue.pop().expect("writer resumed");
        assert!(Arc::ptr_eq(&resumed, &w));
        assert!(matches!(resumed.io_phase(), IoPhase::Refreshing(_)));
        mgr.unlock_request(&w);
    }

    #[test]
    fn test_waiter_blocks_new_readers() {
        let mgr = ConcurrencyManager::new(64, 8);
        let queue = Arc::new(RequestQueue::unkicked());
        let r1 = mapped_request(&queue, &[7], IoDir::Read);
        let w = mapped_request(&queue, &[7], IoDir::Write);
        let r2 = mapped_request(&queue, &[7], IoDir::Read);

        assert_eq!(
            mgr.lock_request(&r1, LockType::Read, cbs()).unwrap(),
            LockStatus::Acquired
        );
        assert_eq!(
            mgr.lock_request(&w, LockType::Write, cbs()).unwrap(),
            LockStatus::Pending
        );
        // a queued writer bars later readers from barging in
        assert_eq!(
            mgr.lock_request(&r2, LockType::Read, cbs()).unwrap(),
            LockStatus::Pending
        );

        mgr.unlock_request(&r1);
        let first = queue.pop().expect("writer first");
        assert!(Arc::ptr_eq(&first, &w));
        assert!(queue.is_empty());

        mgr.unlock_request(&w);
        let second = queue.pop().expect("reader follows");
        assert!(Arc::ptr_eq(&second, &r2));
        mgr.unlock_request(&r2);
    }

    #[test]
    fn test_multi_line_partial_contention() {
        let mgr = ConcurrencyManager::new(64, 8);
        let queue = Arc::new(RequestQueue::unkicked());
        let holder = mapped_request(&queue, &[10], IoDir::Write);
        let waiter = mapped_request(&queue, &[9, 10, 11], IoDir::Write);

        assert_eq!(
            mgr.lock_request(&holder, LockType::Write, cbs()).unwrap(),
            LockStatus::Acquired
        );
        assert_eq!(
            mgr.lock_request(&waiter, LockType::Write, cbs()).unwrap(),
            LockStatus::Pending
        );
        // lines 9 and 11 are already held by the pending request
        assert!(mgr.is_line_locked(9));
        assert!(mgr.is_line_locked(11));

        mgr.unlock_request(&holder);
        let resumed = queue.pop().expect("resumed");
        assert!(Arc::ptr_eq(&resumed, &waiter));
        mgr.unlock_request(&waiter);
        assert!(!mgr.is_line_locked(9));
        assert!(!mgr.is_line_locked(10));
        assert!(!mgr.is_line_locked(11));
    }

    #[test]
    fn test_none_lock_type_is_immediate() {
        let mgr = ConcurrencyManager::new(64, 8);
        let queue = Arc::new(RequestQueue::unkicked());
        let req = mapped_request(&queue, &[3], IoDir::Read);
        assert_eq!(
            mgr.lock_request(&req, LockType::None, cbs()).unwrap(),
            LockStatus::Acquired
        );
        assert!(!mgr.is_line_locked(3));
        mgr.unlock_request(&req);
    }

    #[test]
    fn test_bucket_upgrade() {
        let mgr = ConcurrencyManager::new(64, 8);
        let guards = mgr.lock_buckets_upgradable(&[1, 4, 6]);
        let _write = guards.upgrade();
    }

    #[test]
    fn test_exclusive_excludes_buckets() {
        let mgr = Arc::new(ConcurrencyManager::new(64, 8));
        let ex = mgr.lock_exclusive();

        let mgr2 = mgr.clone();
        let handle = std::thread::spawn(move || {
            // blocks until the exclusive guard drops
            let _guards = mgr2.lock_buckets_read(&[0]);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        drop(ex);
        handle.join().unwrap();
    }
}
