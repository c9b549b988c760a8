//! Cache-line metadata store
//!
//! One slot per cache line, kept in a flat arena. Collision chains, the
//! partition membership lists and the per-sector valid/dirty state are all
//! integer and bitmap fields inside the slot, so there are no pointer cycles
//! and no reclamation hazards.
//!
//! The store itself performs no locking: every accessor documents which lock
//! of the [`crate::lock::ConcurrencyManager`] must be held. Slot fields are
//! atomics only so that slots may be touched through `&self` while different
//! buckets are locked by different threads; all orderings are `Relaxed`
//! because the bucket, partition and global locks already order access.

use cacheio_common::{
    CacheLine, CoreId, CoreLine, INVALID_LINE, MetadataLayout, SectorRange,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use xxhash_rust::xxh64::xxh64;

const INVALID_CORE: u32 = u32::MAX;
const NO_PARTITION: u32 = u32::MAX;

/// Per-cache-line metadata slot.
struct Slot {
    /// Owning core, `INVALID_CORE` when the line is unowned
    core_id: AtomicU32,
    /// Core line hosted by this cache line
    core_line: AtomicU64,
    /// Hash bucket the line is chained into, `INVALID_LINE` when unchained
    bucket: AtomicU32,
    /// Next line in the collision chain
    next: AtomicU32,
    /// Partition membership, `NO_PARTITION` when on the freelist
    part_id: AtomicU32,
    /// Partition membership list links
    part_prev: AtomicU32,
    part_next: AtomicU32,
    /// One bit per sector: the cached data is current
    valid: AtomicU64,
    /// One bit per sector: the cached data is newer than the core's
    dirty: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            core_id: AtomicU32::new(INVALID_CORE),
            core_line: AtomicU64::new(0),
            bucket: AtomicU32::new(INVALID_LINE),
            next: AtomicU32::new(INVALID_LINE),
            part_id: AtomicU32::new(NO_PARTITION),
            part_prev: AtomicU32::new(INVALID_LINE),
            part_next: AtomicU32::new(INVALID_LINE),
            valid: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
        }
    }
}

/// The metadata store: slot arena plus the hash-bucket heads.
pub struct Metadata {
    slots: Vec<Slot>,
    buckets: Vec<AtomicU32>,
    sectors_per_line: u32,
    layout: MetadataLayout,
}

impl Metadata {
    pub fn new(line_count: u32, bucket_count: u32, sectors_per_line: u32, layout: MetadataLayout) -> Self {
        let slots = (0..line_count).map(|_| Slot::new()).collect();
        let buckets = (0..bucket_count)
            .map(|_| AtomicU32::new(INVALID_LINE))
            .collect();
        Self {
            slots,
            buckets,
            sectors_per_line,
            layout,
        }
    }

    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.slots.len() as u32
    }

    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    #[must_use]
    pub fn sectors_per_line(&self) -> u32 {
        self.sectors_per_line
    }

    fn slot(&self, line: CacheLine) -> &Slot {
        &self.slots[line as usize]
    }

    /// Hash bucket for a (core, core line) pair.
    #[must_use]
    pub fn hash_func(&self, core_id: CoreId, core_line: CoreLine) -> u32 {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&core_line.to_le_bytes());
        key[8..10].copy_from_slice(&core_id.to_le_bytes());
        (xxh64(&key, 0) % u64::from(self.bucket_count())) as u32
    }

    /// Logical-to-physical index, used for sequentiality detection only.
    #[must_use]
    pub fn lg2phy(&self, line: CacheLine) -> u64 {
        match self.layout {
            MetadataLayout::Sequential => u64::from(line),
            MetadataLayout::Striping { unit } => {
                let stripes = u64::from(self.line_count().div_ceil(unit));
                u64::from(line % unit) * stripes + u64::from(line / unit)
            }
        }
    }

    // --- collision chains (bucket lock required) ---

    /// Head of a bucket's collision chain, `INVALID_LINE` when empty.
    #[must_use]
    pub fn collision_head(&self, bucket: u32) -> CacheLine {
        self.buckets[bucket as usize].load(Ordering::Relaxed)
    }

    /// Next line in the collision chain.
    #[must_use]
    pub fn collision_next(&self, line: CacheLine) -> CacheLine {
        self.slot(line).next.load(Ordering::Relaxed)
    }

    /// Owning (core, core line) of a cache line, `None` when unowned.
    #[must_use]
    pub fn core_info(&self, line: CacheLine) -> Option<(CoreId, CoreLine)> {
        let slot = self.slot(line);
        let core = slot.core_id.load(Ordering::Relaxed);
        if core == INVALID_CORE {
            None
        } else {
            Some((core as CoreId, slot.core_line.load(Ordering::Relaxed)))
        }
    }

    /// Bucket a line is currently chained into.
    #[must_use]
    pub fn bucket_of(&self, line: CacheLine) -> CacheLine {
        self.slot(line).bucket.load(Ordering::Relaxed)
    }

    /// Take ownership of `line` for `(core_id, core_line)` and splice it at
    /// the head of `bucket`'s collision chain.
    ///
    /// Caller holds the bucket's write lock (or the global exclusive lock)
    /// and the line's collision shared-access guard.
    pub fn add_to_collision(&self, core_id: CoreId, core_line: CoreLine, bucket: u32, line: CacheLine) {
        let slot = self.slot(line);
        debug_assert_eq!(slot.core_id.load(Ordering::Relaxed), INVALID_CORE);
        debug_assert_eq!(slot.valid.load(Ordering::Relaxed), 0);
        slot.core_id.store(u32::from(core_id), Ordering::Relaxed);
        slot.core_line.store(core_line, Ordering::Relaxed);
        slot.bucket.store(bucket, Ordering::Relaxed);

        let head = &self.buckets[bucket as usize];
        slot.next.store(head.load(Ordering::Relaxed), Ordering::Relaxed);
        head.store(line, Ordering::Relaxed);
    }

    /// Unlink `line` from its collision chain and clear its ownership.
    ///
    /// Caller holds the bucket's write lock (or the global exclusive lock)
    /// and the line's collision shared-access guard.
    pub fn remove_from_collision(&self, line: CacheLine) {
        let slot = self.slot(line);
        let bucket = slot.bucket.load(Ordering::Relaxed);
        debug_assert_ne!(bucket, INVALID_LINE);

        let next = slot.next.load(Ordering::Relaxed);
        let head = &self.buckets[bucket as usize];
        let mut cur = head.load(Ordering::Relaxed);
        if cur == line {
            head.store(next, Ordering::Relaxed);
        } else {
            while cur != INVALID_LINE {
                let cur_slot = self.slot(cur);
                let cur_next = cur_slot.next.load(Ordering::Relaxed);
                if cur_next == line {
                    cur_slot.next.store(next, Ordering::Relaxed);
                    break;
                }
                cur = cur_next;
            }
        }

        slot.next.store(INVALID_LINE, Ordering::Relaxed);
        slot.bucket.store(INVALID_LINE, Ordering::Relaxed);
        slot.core_id.store(INVALID_CORE, Ordering::Relaxed);
        slot.core_line.store(0, Ordering::Relaxed);
    }

    // --- partition membership (partition lock required) ---

    #[must_use]
    pub fn partition_id(&self, line: CacheLine) -> Option<u16> {
        let part = self.slot(line).part_id.load(Ordering::Relaxed);
        if part == NO_PARTITION {
            None
        } else {
            Some(part as u16)
        }
    }

    pub fn set_partition_id(&self, line: CacheLine, part: Option<u16>) {
        let raw = part.map_or(NO_PARTITION, u32::from);
        self.slot(line).part_id.store(raw, Ordering::Relaxed);
    }

    pub(crate) fn part_next(&self, line: CacheLine) -> CacheLine {
        self.slot(line).part_next.load(Ordering::Relaxed)
    }

    pub(crate) fn part_prev(&self, line: CacheLine) -> CacheLine {
        self.slot(line).part_prev.load(Ordering::Relaxed)
    }

    pub(crate) fn set_part_links(&self, line: CacheLine, prev: CacheLine, next: CacheLine) {
        let slot = self.slot(line);
        slot.part_prev.store(prev, Ordering::Relaxed);
        slot.part_next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn set_part_next(&self, line: CacheLine, next: CacheLine) {
        self.slot(line).part_next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn set_part_prev(&self, line: CacheLine, prev: CacheLine) {
        self.slot(line).part_prev.store(prev, Ordering::Relaxed);
    }

    // --- sector bitmaps (bucket lock required) ---

    /// True when every sector in `range` is valid.
    #[must_use]
    pub fn test_valid_range(&self, line: CacheLine, range: SectorRange) -> bool {
        let mask = range.mask();
        self.slot(line).valid.load(Ordering::Relaxed) & mask == mask
    }

    #[must_use]
    pub fn any_valid(&self, line: CacheLine) -> bool {
        self.slot(line).valid.load(Ordering::Relaxed) != 0
    }

    pub fn set_valid_range(&self, line: CacheLine, range: SectorRange) {
        self.slot(line).valid.fetch_or(range.mask(), Ordering::Relaxed);
    }

    /// Clear valid bits in `range`. Returns true when the line ended up with
    /// no valid sectors at all.
    pub fn clear_valid_range(&self, line: CacheLine, range: SectorRange) -> bool {
        let prev = self.slot(line).valid.fetch_and(!range.mask(), Ordering::Relaxed);
        (prev & !range.mask()) == 0
    }

    /// True when any sector in `range` is dirty.
    #[must_use]
    pub fn any_dirty_range(&self, line: CacheLine, range: SectorRange) -> bool {
        self.slot(line).dirty.load(Ordering::Relaxed) & range.mask() != 0
    }

    /// True when every sector in `range` is dirty.
    #[must_use]
    pub fn all_dirty_range(&self, line: CacheLine, range: SectorRange) -> bool {
        let mask = range.mask();
        self.slot(line).dirty.load(Ordering::Relaxed) & mask == mask
    }

    #[must_use]
    pub fn any_dirty(&self, line: CacheLine) -> bool {
        self.slot(line).dirty.load(Ordering::Relaxed) != 0
    }

    pub fn set_dirty_range(&self, line: CacheLine, range: SectorRange) {
        self.slot(line).dirty.fetch_or(range.mask(), Ordering::Relaxed);
    }

    pub fn clear_dirty_range(&self, line: CacheLine, range: SectorRange) {
        self.slot(line).dirty.fetch_and(!range.mask(), Ordering::Relaxed);
    }

    /// Full-line sector range.
    #[must_use]
    pub fn full_range(&self) -> SectorRange {
        SectorRange::new(0, (self.sectors_per_line - 1) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Metadata {
        Metadata::new(16, 4, 8, MetadataLayout::Sequential)
    }

    #[test]
    fn test_hash_is_stable_and_in_range() {
        let m = meta();
        let h = m.hash_func(1, 42);
        assert_eq!(h, m.hash_func(1, 42));
        assert!(h < m.bucket_count());
        // different cores must be able to hash apart
        assert!((0..64).any(|l| m.hash_func(0, l) != m.hash_func(1, l)));
    }

    #[test]
    fn test_collision_add_remove() {
        let m = meta();
        let bucket = m.hash_func(0, 7);
        m.add_to_collision(0, 7, bucket, 3);
        m.add_to_collision(0, 11, bucket, 5);

        // most-recent insert is the head
        assert_eq!(m.collision_head(bucket), 5);
        assert_eq!(m.collision_next(5), 3);
        assert_eq!(m.core_info(3), Some((0, 7)));
        assert_eq!(m.core_info(5), Some((0, 11)));
        assert_eq!(m.bucket_of(3), bucket);

        m.remove_from_collision(3);
        assert_eq!(m.collision_head(bucket), 5);
        assert_eq!(m.collision_next(5), INVALID_LINE);
        assert_eq!(m.core_info(3), None);
        assert_eq!(m.bucket_of(3), INVALID_LINE);

        m.remove_from_collision(5);
        assert_eq!(m.collision_head(bucket), INVALID_LINE);
    }

    #[test]
    fn test_valid_bitmap_ops() {
        let m = meta();
        let full = m.full_range();
        assert!(!m.test_valid_range(0, full));

        m.set_valid_range(0, SectorRange::new(0, 3));
        assert!(m.test_valid_range(0, SectorRange::new(0, 3)));
        assert!(!m.test_valid_range(0, full));
        assert!(m.any_valid(0));

        let empty = m.clear_valid_range(0, SectorRange::new(0, 1));
        assert!(!empty);
        let empty = m.clear_valid_range(0, SectorRange::new(2, 3));
        assert!(empty);
    }

    #[test]
    fn test_dirty_bitmap_ops() {
        let m = meta();
        m.set_dirty_range(2, SectorRange::new(0, 7));
        assert!(m.any_dirty(2));
        assert!(m.all_dirty_range(2, m.full_range()));

        m.clear_dirty_range(2, SectorRange::new(0, 6));
        assert!(m.any_dirty_range(2, m.full_range()));
        assert!(!m.all_dirty_range(2, m.full_range()));
    }

    #[test]
    fn test_lg2phy_sequential() {
        let m = meta();
        assert_eq!(m.lg2phy(0), 0);
        assert_eq!(m.lg2phy(9), 9);
    }

    #[test]
    fn test_lg2phy_striping_is_injective() {
        let m = Metadata::new(16, 4, 8, MetadataLayout::Striping { unit: 4 });
        let mut seen = std::collections::HashSet::new();
        for line in 0..16 {
            assert!(seen.insert(m.lg2phy(line)));
        }
        // consecutive logical lines land one stripe apart
        assert_ne!(m.lg2phy(1), m.lg2phy(0) + 1);
    }
}
