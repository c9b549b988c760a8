//! The cache handle
//!
//! Owns the metadata store, freelist, partition table, concurrency manager,
//! statistics and the collaborator policies. Requests borrow access to all
//! of it through the locks; nothing here is process-global.

use crate::fallback::FallbackPassthrough;
use crate::freelist::Freelist;
use crate::lock::ConcurrencyManager;
use crate::metadata::Metadata;
use crate::partition::PartitionTable;
use crate::policy::{
    AlwaysPromote, Cleaner, CleaningPolicy, EvictionPolicy, IoInterface, NoEviction, NopCleaner,
    NopCleaning, PromotionPolicy,
};
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::stats::CacheStats;
use cacheio_common::{
    CacheConfig, CacheLine, CoreId, Error, IoDir, PartitionId, Result, SectorRange,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Cache {
    config: CacheConfig,
    metadata: Metadata,
    freelist: Freelist,
    partitions: PartitionTable,
    concurrency: ConcurrencyManager,
    stats: CacheStats,
    fallback_pt: FallbackPassthrough,
    failed: AtomicBool,
    eviction: Arc<dyn EvictionPolicy>,
    cleaning: Arc<dyn CleaningPolicy>,
    promotion: Arc<dyn PromotionPolicy>,
    cleaner: Arc<dyn Cleaner>,
}

/// Builder wiring a cache to its collaborator policies.
pub struct CacheBuilder {
    config: CacheConfig,
    eviction: Arc<dyn EvictionPolicy>,
    cleaning: Arc<dyn CleaningPolicy>,
    promotion: Arc<dyn PromotionPolicy>,
    cleaner: Arc<dyn Cleaner>,
}

impl CacheBuilder {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            eviction: Arc::new(NoEviction),
            cleaning: Arc::new(NopCleaning),
            promotion: Arc::new(AlwaysPromote),
            cleaner: Arc::new(NopCleaner),
        }
    }

    #[must_use]
    pub fn eviction(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = policy;
        self
    }

    #[must_use]
    pub fn cleaning(mut self, policy: Arc<dyn CleaningPolicy>) -> Self {
        self.cleaning = policy;
        self
    }

    #[must_use]
    pub fn promotion(mut self, policy: Arc<dyn PromotionPolicy>) -> Self {
        self.promotion = policy;
        self
    }

    #[must_use]
    pub fn cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn build(self) -> Result<Arc<Cache>> {
        self.config.validate()?;
        let line_count = self.config.cache_line_count;
        let bucket_count = self.config.effective_bucket_count();
        let sectors = self.config.sectors_per_line();

        Ok(Arc::new(Cache {
            metadata: Metadata::new(line_count, bucket_count, sectors, self.config.metadata_layout),
            freelist: Freelist::new(line_count),
            partitions: PartitionTable::new(&self.config),
            concurrency: ConcurrencyManager::new(line_count, bucket_count),
            stats: CacheStats::default(),
            fallback_pt: FallbackPassthrough::new(self.config.fallback_pt_error_threshold),
            failed: AtomicBool::new(false),
            eviction: self.eviction,
            cleaning: self.cleaning,
            promotion: self.promotion,
            cleaner: self.cleaner,
            config: self.config,
        }))
    }
}

impl Cache {
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    #[must_use]
    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    #[must_use]
    pub fn fallback_pt(&self) -> &FallbackPassthrough {
        &self.fallback_pt
    }

    pub(crate) fn eviction(&self) -> &dyn EvictionPolicy {
        self.eviction.as_ref()
    }

    pub(crate) fn cleaning(&self) -> &dyn CleaningPolicy {
        self.cleaning.as_ref()
    }

    pub(crate) fn promotion(&self) -> &dyn PromotionPolicy {
        self.promotion.as_ref()
    }

    pub(crate) fn cleaner(&self) -> &dyn Cleaner {
        self.cleaner.as_ref()
    }

    /// Whether a fatal error latched the cache into its failed state.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Build a request against this cache.
    #[allow(clippy::too_many_arguments)]
    pub fn new_request(
        &self,
        core_id: CoreId,
        part_id: PartitionId,
        rw: IoDir,
        addr: u64,
        bytes: u64,
        queue: Arc<RequestQueue>,
        io: Arc<dyn IoInterface>,
        complete: Box<dyn FnOnce(Result<()>) + Send>,
    ) -> Result<Arc<Request>> {
        if !self.partitions.contains(part_id) {
            return Err(Error::invalid_request(format!(
                "unknown partition {part_id}"
            )));
        }
        Request::new(
            core_id,
            part_id,
            rw,
            addr,
            bytes,
            self.config.cache_line_size,
            self.config.sectors_per_line(),
            queue,
            io,
            complete,
        )
    }

    /// Clear valid bits in `range` without flushing anything. A line left
    /// with no valid sectors is unhooked from its collision chain and
    /// partition and returned to the freelist.
    ///
    /// Caller holds the line's bucket write lock (or the global exclusive
    /// lock) and its collision-access guard.
    pub fn set_cache_line_invalid_no_flush(&self, range: SectorRange, line: CacheLine) {
        let fully_invalid = self.metadata.clear_valid_range(line, range);
        if !fully_invalid {
            return;
        }
        self.metadata.clear_dirty_range(line, self.metadata.full_range());
        if let Some(part) = self.metadata.partition_id(line) {
            self.partitions.remove(&self.metadata, part, line);
        }
        self.metadata.remove_from_collision(line);
        self.freelist.push(line);
    }
}
