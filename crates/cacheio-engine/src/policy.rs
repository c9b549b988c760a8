//! Collaborator interfaces
//!
//! The engine core coordinates eviction, cleaning, promotion, the cleaner
//! and the engine variants without implementing any of them. Everything
//! here is an in-process trait; implementations live outside this crate.

use crate::cache::Cache;
use crate::lock::LockType;
use crate::queue::RequestQueue;
use crate::request::Request;
use cacheio_common::{CacheLine, Error, Result};
use std::sync::Arc;

/// Eviction policy: chooses victims and tracks hotness.
pub trait EvictionPolicy: Send + Sync {
    /// A line left the freelist and now hosts data.
    fn init_cache_line(&self, line: CacheLine);

    /// A mapped line was touched by a request.
    fn set_hot(&self, line: CacheLine);

    /// Reclaim `count` lines for `req`, honoring `req.part_evict()`.
    ///
    /// Called under the global metadata exclusive lock. Victims are either
    /// freed back to the freelist or remapped straight into the request via
    /// [`crate::engine::map_cache_line`]. Returns
    /// [`Error::NoEvictableLines`] when the policy cannot supply enough.
    fn evict(&self, cache: &Cache, req: &Request, count: u32) -> Result<()>;
}

/// Eviction stub that never reclaims. The builder default; real caches
/// install a policy.
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn init_cache_line(&self, _line: CacheLine) {}

    fn set_hot(&self, _line: CacheLine) {}

    fn evict(&self, _cache: &Cache, _req: &Request, count: u32) -> Result<()> {
        if count == 0 { Ok(()) } else { Err(Error::NoEvictableLines) }
    }
}

/// Cleaning policy hook: notified when a line first hosts data so the
/// policy can start tracking it.
pub trait CleaningPolicy: Send + Sync {
    fn init_cache_block(&self, cache: &Cache, line: CacheLine) {
        let _ = (cache, line);
    }
}

/// Cleaning policy that tracks nothing.
pub struct NopCleaning;

impl CleaningPolicy for NopCleaning {}

/// Promotion policy: decides whether a missed request is worth admitting.
pub trait PromotionPolicy: Send + Sync {
    fn should_promote(&self, cache: &Cache, req: &Request) -> bool;

    /// Forget any miss-tracking state for the request's lines; called after
    /// they were admitted.
    fn purge(&self, cache: &Cache, req: &Request);
}

/// Promotion policy that admits everything.
pub struct AlwaysPromote;

impl PromotionPolicy for AlwaysPromote {
    fn should_promote(&self, _cache: &Cache, _req: &Request) -> bool {
        true
    }

    fn purge(&self, _cache: &Cache, _req: &Request) {}
}

/// Writeback work order handed to the cleaner.
pub struct CleanerAttribs {
    /// Yields the cache line of each dirty entry in map order; `None` stops
    /// the walk.
    pub getter: Box<dyn FnMut() -> Option<CacheLine> + Send>,
    /// Number of lines the getter will yield.
    pub count: u32,
    /// Invoked exactly once when the writeback finished or failed.
    pub complete: Box<dyn FnOnce(Result<()>) + Send>,
    /// Whether the cleaner must take line locks itself. False when the
    /// issuing request already holds them.
    pub lock_cacheline: bool,
    /// Queue the cleaner should do its I/O on.
    pub queue: Arc<RequestQueue>,
}

/// The cleaner: writes dirty lines back to their core device.
pub trait Cleaner: Send + Sync {
    fn fire(&self, cache: &Arc<Cache>, attribs: CleanerAttribs);
}

/// Cleaner for caches that never hold dirty data (write-through /
/// write-around modes): completes immediately.
pub struct NopCleaner;

impl Cleaner for NopCleaner {
    fn fire(&self, _cache: &Arc<Cache>, attribs: CleanerAttribs) {
        (attribs.complete)(Ok(()));
    }
}

/// I/O interface a worker runs when it pops a request. The engine swaps in
/// a refresh interface transiently after a line-lock wait.
pub trait IoInterface: Send + Sync {
    fn read(&self, cache: &Arc<Cache>, req: &Arc<Request>);
    fn write(&self, cache: &Arc<Cache>, req: &Arc<Request>);
}

/// Interface that drops every dispatch. Useful as a stub while wiring up
/// tests or pass-through paths.
pub struct NullIo;

impl IoInterface for NullIo {
    fn read(&self, _cache: &Arc<Cache>, _req: &Arc<Request>) {}

    fn write(&self, _cache: &Arc<Cache>, _req: &Arc<Request>) {}
}

/// Hooks an engine variant supplies to the preparation pipeline.
pub trait EngineCallbacks: Send + Sync {
    /// Which per-line lock the variant needs for its I/O phase.
    fn lock_type(&self, cache: &Cache, req: &Request) -> LockType;

    /// Continuation fired when an asynchronous line-lock acquisition
    /// finally completes.
    fn resume(&self, req: &Arc<Request>) {
        req.resume();
    }
}

/// Stock callbacks: writes take write locks, reads take read locks, and
/// resume goes through the standard refresh path.
pub struct DefaultCallbacks;

impl EngineCallbacks for DefaultCallbacks {
    fn lock_type(&self, _cache: &Cache, req: &Request) -> LockType {
        if req.rw().is_write() {
            LockType::Write
        } else {
            LockType::Read
        }
    }
}
