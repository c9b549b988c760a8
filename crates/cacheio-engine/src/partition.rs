//! Cache partitions
//!
//! A partition is a named subset of cache lines with its own quota and
//! enable flag. Membership is an intrusive doubly-linked list threaded
//! through the metadata slots; each list is guarded by its partition's
//! mutex, taken while the caller already holds a bucket write lock or the
//! global exclusive lock.

use crate::metadata::Metadata;
use cacheio_common::{CacheConfig, CacheLine, INVALID_LINE, PartitionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

struct PartList {
    head: CacheLine,
    count: u32,
}

struct Partition {
    name: String,
    quota: u32,
    enabled: AtomicBool,
    list: Mutex<PartList>,
}

pub struct PartitionTable {
    parts: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(config: &CacheConfig) -> Self {
        let parts = config
            .partitions
            .iter()
            .map(|p| Partition {
                name: p.name.clone(),
                quota: config.partition_quota(p),
                enabled: AtomicBool::new(p.enabled),
                list: Mutex::new(PartList {
                    head: INVALID_LINE,
                    count: 0,
                }),
            })
            .collect();
        Self { parts }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    #[must_use]
    pub fn contains(&self, part: PartitionId) -> bool {
        usize::from(part) < self.parts.len()
    }

    #[must_use]
    pub fn name(&self, part: PartitionId) -> &str {
        &self.parts[usize::from(part)].name
    }

    #[must_use]
    pub fn is_enabled(&self, part: PartitionId) -> bool {
        self.parts[usize::from(part)]
            .enabled
            .load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, part: PartitionId, enabled: bool) {
        self.parts[usize::from(part)]
            .enabled
            .store(enabled, Ordering::Relaxed);
    }

    /// Current number of lines in the partition.
    #[must_use]
    pub fn count(&self, part: PartitionId) -> u32 {
        self.parts[usize::from(part)].list.lock().count
    }

    /// Whether `needed` more lines fit within the partition's quota.
    #[must_use]
    pub fn has_space(&self, part: PartitionId, needed: u32) -> bool {
        let p = &self.parts[usize::from(part)];
        needed <= p.quota.saturating_sub(p.list.lock().count)
    }

    /// Link `line` into the partition at the head of its membership list.
    pub fn add(&self, meta: &Metadata, part: PartitionId, line: CacheLine) {
        let mut list = self.parts[usize::from(part)].list.lock();
        meta.set_part_links(line, INVALID_LINE, list.head);
        if list.head != INVALID_LINE {
            meta.set_part_prev(list.head, line);
        }
        list.head = line;
        list.count += 1;
        meta.set_partition_id(line, Some(part));
    }

    /// Unlink `line` from the partition.
    pub fn remove(&self, meta: &Metadata, part: PartitionId, line: CacheLine) {
        let mut list = self.parts[usize::from(part)].list.lock();
        debug_assert_eq!(meta.partition_id(line), Some(part));

        let prev = meta.part_prev(line);
        let next = meta.part_next(line);
        if prev != INVALID_LINE {
            meta.set_part_next(prev, next);
        } else {
            list.head = next;
        }
        if next != INVALID_LINE {
            meta.set_part_prev(next, prev);
        }
        list.count -= 1;
        meta.set_part_links(line, INVALID_LINE, INVALID_LINE);
        meta.set_partition_id(line, None);
    }

    /// Move a line between partitions.
    pub fn move_line(&self, meta: &Metadata, from: PartitionId, to: PartitionId, line: CacheLine) {
        if from == to {
            return;
        }
        self.remove(meta, from, line);
        self.add(meta, to, line);
    }

    /// Snapshot of the partition's member lines, head first.
    ///
    /// Collaborators (eviction policies) use this to scan for victims.
    #[must_use]
    pub fn lines(&self, meta: &Metadata, part: PartitionId) -> Vec<CacheLine> {
        let list = self.parts[usize::from(part)].list.lock();
        let mut out = Vec::with_capacity(list.count as usize);
        let mut cur = list.head;
        while cur != INVALID_LINE {
            out.push(cur);
            cur = meta.part_next(cur);
        }
        out
    }
}
