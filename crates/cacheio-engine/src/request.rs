//! Request object and map array
//!
//! A request covers a contiguous run of core lines. Preparation fills one
//! map entry per core line and accumulates aggregate counters; the entries
//! then drive mapping, line locking and the clean/refresh paths.
//!
//! A request is owned by exactly one actor at a time. Ownership transfers by
//! queueing: after a push the pusher must not touch the request again. The
//! interior mutex exists for the well-defined handoff points (lock grant,
//! cleaner completion), not for concurrent mutation.

use crate::lock::LockType;
use crate::metadata::Metadata;
use crate::policy::{EngineCallbacks, IoInterface};
use crate::queue::RequestQueue;
use cacheio_common::{
    CacheLine, CoreId, CoreLine, Error, INVALID_LINE, IoDir, PartitionId, Result, SectorRange,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Outcome of looking up one core line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupStatus {
    /// No cache line hosts this core line
    #[default]
    Miss,
    /// An existing cache line hosts it
    Hit,
    /// A freelist line was assigned during mapping
    Inserted,
    /// An evicted line was reassigned during mapping
    Remapped,
}

impl LookupStatus {
    /// Any status other than `Miss`.
    #[must_use]
    pub fn is_mapped(self) -> bool {
        !matches!(self, LookupStatus::Miss)
    }
}

/// Per-core-line state of one request.
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    /// Core line this entry covers
    pub core_line: CoreLine,
    /// Hash bucket, recorded so insertion knows where to splice
    pub hash: u32,
    /// Assigned cache line, `INVALID_LINE` when unassigned
    pub coll_idx: CacheLine,
    pub status: LookupStatus,
    /// Set by `check` when metadata changed under a suspended request
    pub invalid: bool,
    /// The hosting line currently belongs to a different partition
    pub re_part: bool,
}

impl MapEntry {
    fn new(core_line: CoreLine) -> Self {
        Self {
            core_line,
            hash: 0,
            coll_idx: INVALID_LINE,
            status: LookupStatus::Miss,
            invalid: false,
            re_part: false,
        }
    }
}

/// Aggregate counters over a request's map entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestInfo {
    /// Entries fully valid for their sector range
    pub hit_no: u32,
    /// Hit entries whose valid bits do not cover the range
    pub invalid_no: u32,
    /// Entries assigned a line during mapping
    pub insert_no: u32,
    /// Hit entries hosted in a foreign partition
    pub re_part_no: u32,
    /// Adjacent mapped pairs contiguous in physical index
    pub seq_no: u32,
    /// Entries with at least one dirty sector in range
    pub dirty_any: u32,
    /// Entries with every sector in range dirty
    pub dirty_all: u32,
}

impl RequestInfo {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Which I/O interface a dispatched request runs.
///
/// `Refreshing` carries the interface saved when the engine installed the
/// post-resume consistency check; it is restored once the check passes.
#[derive(Clone)]
pub enum IoPhase {
    Normal(Arc<dyn IoInterface>),
    Refreshing(Arc<dyn IoInterface>),
}

type CompleteFn = Box<dyn FnOnce(Result<()>) + Send>;

pub(crate) struct ReqState {
    pub map: Vec<MapEntry>,
    pub info: RequestInfo,
    pub mapping_error: bool,
    pub part_evict: bool,
    pub io: IoPhase,
    pub lock_rw: LockType,
}

pub struct Request {
    core_id: CoreId,
    part_id: PartitionId,
    rw: IoDir,
    addr: u64,
    bytes: u64,
    core_line_first: CoreLine,
    core_line_count: u32,
    line_size: u64,
    sectors_per_line: u32,
    internal: AtomicBool,
    queue: Arc<RequestQueue>,
    pub(crate) state: Mutex<ReqState>,
    /// Line-lock grant countdown, including one guard token held by the
    /// acquiring thread (see [`crate::lock::ConcurrencyManager`])
    pub(crate) lock_remaining: AtomicU32,
    pub(crate) resume_cbs: Mutex<Option<Arc<dyn EngineCallbacks>>>,
    complete_fn: Mutex<Option<CompleteFn>>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core_id: CoreId,
        part_id: PartitionId,
        rw: IoDir,
        addr: u64,
        bytes: u64,
        line_size: u64,
        sectors_per_line: u32,
        queue: Arc<RequestQueue>,
        io: Arc<dyn IoInterface>,
        complete: CompleteFn,
    ) -> Result<Arc<Self>> {
        if bytes == 0 {
            return Err(Error::invalid_request("zero-length request"));
        }
        let core_line_first = addr / line_size;
        let core_line_last = (addr + bytes - 1) / line_size;
        let core_line_count = (core_line_last - core_line_first + 1) as u32;

        Ok(Arc::new(Self {
            core_id,
            part_id,
            rw,
            addr,
            bytes,
            core_line_first,
            core_line_count,
            line_size,
            sectors_per_line,
            internal: AtomicBool::new(false),
            queue,
            state: Mutex::new(ReqState {
                map: Vec::new(),
                info: RequestInfo::default(),
                mapping_error: false,
                part_evict: false,
                io: IoPhase::Normal(io),
                lock_rw: LockType::None,
            }),
            lock_remaining: AtomicU32::new(0),
            resume_cbs: Mutex::new(None),
            complete_fn: Mutex::new(Some(complete)),
        }))
    }

    #[must_use]
    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    #[must_use]
    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    #[must_use]
    pub fn rw(&self) -> IoDir {
        self.rw
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn core_line_first(&self) -> CoreLine {
        self.core_line_first
    }

    #[must_use]
    pub fn core_line_count(&self) -> u32 {
        self.core_line_count
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal.load(Ordering::Relaxed)
    }

    /// Mark the request as engine-internal; internal requests are excluded
    /// from request statistics.
    pub fn mark_internal(&self) {
        self.internal.store(true, Ordering::Relaxed);
    }

    /// Sector range the request touches within entry `idx`'s cache line.
    #[must_use]
    pub fn entry_sector_range(&self, idx: u32) -> SectorRange {
        let start = if idx == 0 {
            (self.addr % self.line_size) / (self.line_size / u64::from(self.sectors_per_line))
        } else {
            0
        };
        let end = if idx == self.core_line_count - 1 {
            ((self.addr + self.bytes - 1) % self.line_size)
                / (self.line_size / u64::from(self.sectors_per_line))
        } else {
            u64::from(self.sectors_per_line) - 1
        };
        SectorRange::new(start as u8, end as u8)
    }

    /// Allocate the map array and record each entry's hash bucket.
    ///
    /// Idempotent: a request resumed after suspension keeps its entries.
    pub fn init_map(&self, meta: &Metadata) {
        let mut state = self.state.lock();
        if !state.map.is_empty() {
            return;
        }
        state.map = (0..self.core_line_count)
            .map(|i| {
                let core_line = self.core_line_first + u64::from(i);
                let mut entry = MapEntry::new(core_line);
                entry.hash = meta.hash_func(self.core_id, core_line);
                entry
            })
            .collect();
    }

    /// Copy of entry `idx`.
    #[must_use]
    pub fn map_entry(&self, idx: u32) -> MapEntry {
        self.state.lock().map[idx as usize]
    }

    /// Copy of the aggregate info.
    #[must_use]
    pub fn info(&self) -> RequestInfo {
        self.state.lock().info
    }

    #[must_use]
    pub fn mapping_error(&self) -> bool {
        self.state.lock().mapping_error
    }

    pub(crate) fn set_mapping_error(&self) {
        self.state.lock().mapping_error = true;
    }

    #[must_use]
    pub fn part_evict(&self) -> bool {
        self.state.lock().part_evict
    }

    /// Number of entries still without a cache line.
    #[must_use]
    pub fn unmapped_count(&self) -> u32 {
        let state = self.state.lock();
        state
            .map
            .iter()
            .filter(|e| !e.status.is_mapped())
            .count() as u32
    }

    #[must_use]
    pub fn is_fully_mapped(&self) -> bool {
        self.unmapped_count() == 0
    }

    /// Cache lines of all mapped entries, in map order.
    pub(crate) fn mapped_lines(&self) -> Vec<CacheLine> {
        let state = self.state.lock();
        state
            .map
            .iter()
            .filter(|e| e.status.is_mapped() && e.coll_idx != INVALID_LINE)
            .map(|e| e.coll_idx)
            .collect()
    }

    /// Sorted, deduplicated hash buckets of the request's entries.
    pub(crate) fn sorted_buckets(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut buckets: Vec<u32> = state.map.iter().map(|e| e.hash).collect();
        buckets.sort_unstable();
        buckets.dedup();
        buckets
    }

    /// Whether every adjacent pair of mapped lines is physically contiguous.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        let state = self.state.lock();
        self.core_line_count > 1 && state.info.seq_no == self.core_line_count - 1
    }

    // --- I/O phase ---

    /// The interface a worker should run for this request.
    #[must_use]
    pub fn io_phase(&self) -> IoPhase {
        self.state.lock().io.clone()
    }

    /// Save the current interface and install the refresh pass.
    pub(crate) fn install_refresh(&self) {
        let mut state = self.state.lock();
        if let IoPhase::Normal(io) = state.io.clone() {
            state.io = IoPhase::Refreshing(io);
        }
    }

    /// Drop the refresh pass, restoring and returning the saved interface.
    pub(crate) fn restore_io(&self) -> Arc<dyn IoInterface> {
        let mut state = self.state.lock();
        let io = match state.io.clone() {
            IoPhase::Normal(io) | IoPhase::Refreshing(io) => io,
        };
        state.io = IoPhase::Normal(io.clone());
        io
    }

    /// Line-lock grant callback: install the refresh interface and requeue
    /// at the front so the consistency check runs before the actual I/O.
    pub fn resume(self: &Arc<Self>) {
        self.install_refresh();
        self.queue.push_front(self.clone(), true);
    }

    /// Fire the completion callback. Later calls are no-ops; a request
    /// completes exactly once.
    pub fn complete(&self, result: Result<()>) {
        if let Some(cb) = self.complete_fn.lock().take() {
            cb(result);
        }
    }
}
