//! Configuration types for CacheIO
//!
//! This module defines the configuration structures consumed when a cache is
//! started. All sizes are in bytes unless the field name says otherwise.

use crate::error::{Error, Result};
use crate::types::INVALID_LINE;
use serde::{Deserialize, Serialize};

/// Sector bitmaps are stored in one 64-bit word per cache line.
pub const MAX_SECTORS_PER_LINE: u64 = 64;

/// How logical cache-line indices map to physical slots on the cache device.
///
/// Sequentiality detection compares *physical* indices of adjacent mapped
/// lines, so the layout matters to the sequential-request classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataLayout {
    /// Logical index equals physical index.
    Sequential,
    /// Lines are striped across the device in units of `unit` lines.
    Striping { unit: u32 },
}

impl Default for MetadataLayout {
    fn default() -> Self {
        MetadataLayout::Sequential
    }
}

/// Per-partition configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Human-readable partition name
    pub name: String,
    /// Maximum number of cache lines the partition may hold (0 = whole cache)
    #[serde(default)]
    pub max_size: u32,
    /// Whether new lines may be admitted into the partition
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl PartitionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 0,
            enabled: true,
        }
    }
}

/// Root configuration for one cache instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Size of one cache line in bytes
    pub cache_line_size: u64,
    /// Sector size in bytes (granularity of the valid/dirty bitmaps)
    pub sector_size: u64,
    /// Number of cache lines on the cache device
    pub cache_line_count: u32,
    /// Number of hash buckets in the collision table (0 = derived)
    #[serde(default)]
    pub hash_bucket_count: u32,
    /// Logical-to-physical layout of cache-line metadata
    #[serde(default)]
    pub metadata_layout: MetadataLayout,
    /// I/O errors tolerated before the cache trips into pass-through
    /// mode (0 = never)
    #[serde(default)]
    pub fallback_pt_error_threshold: u64,
    /// User-defined partitions; partition ids are indices into this list
    pub partitions: Vec<PartitionConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_line_size: 4096,
            sector_size: 512,
            cache_line_count: 0,
            hash_bucket_count: 0,
            metadata_layout: MetadataLayout::default(),
            fallback_pt_error_threshold: 0,
            partitions: vec![PartitionConfig::new("default")],
        }
    }
}

impl CacheConfig {
    /// Number of sectors in one cache line.
    #[must_use]
    pub fn sectors_per_line(&self) -> u32 {
        (self.cache_line_size / self.sector_size) as u32
    }

    /// Bucket count actually used: the configured value, or one bucket per
    /// four cache lines when left at 0.
    #[must_use]
    pub fn effective_bucket_count(&self) -> u32 {
        if self.hash_bucket_count != 0 {
            self.hash_bucket_count
        } else {
            (self.cache_line_count / 4).max(1)
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(Error::configuration("sector size must be a power of two"));
        }
        if self.cache_line_size == 0 || self.cache_line_size % self.sector_size != 0 {
            return Err(Error::configuration(
                "cache line size must be a non-zero multiple of the sector size",
            ));
        }
        let sectors = self.cache_line_size / self.sector_size;
        if sectors > MAX_SECTORS_PER_LINE {
            return Err(Error::configuration(format!(
                "cache line holds {sectors} sectors, maximum is {MAX_SECTORS_PER_LINE}"
            )));
        }
        if self.cache_line_count == 0 || self.cache_line_count >= INVALID_LINE {
            return Err(Error::configuration(
                "cache line count must be non-zero and below the sentinel",
            ));
        }
        if self.partitions.is_empty() {
            return Err(Error::configuration(
                "at least one partition must be defined",
            ));
        }
        if self.partitions.len() > usize::from(u16::MAX) {
            return Err(Error::configuration("too many partitions"));
        }
        for part in &self.partitions {
            if part.name.is_empty() {
                return Err(Error::configuration("partition name must not be empty"));
            }
            if part.max_size > self.cache_line_count {
                return Err(Error::configuration(format!(
                    "partition {} larger than the cache",
                    part.name
                )));
            }
        }
        if let MetadataLayout::Striping { unit } = self.metadata_layout {
            if unit == 0 {
                return Err(Error::configuration("striping unit must be non-zero"));
            }
        }
        Ok(())
    }

    /// Effective per-partition quota in cache lines.
    #[must_use]
    pub fn partition_quota(&self, part: &PartitionConfig) -> u32 {
        if part.max_size == 0 {
            self.cache_line_count
        } else {
            part.max_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> CacheConfig {
        CacheConfig {
            cache_line_count: 64,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(small_config().validate().is_ok());
    }

    #[test]
    fn test_sectors_per_line() {
        let config = small_config();
        assert_eq!(config.sectors_per_line(), 8);
    }

    #[test]
    fn test_rejects_oversized_line() {
        let config = CacheConfig {
            cache_line_size: 64 * 1024, // 128 sectors
            cache_line_count: 64,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_line_size() {
        let config = CacheConfig {
            cache_line_size: 4000,
            cache_line_count: 64,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_partitions() {
        let config = CacheConfig {
            cache_line_count: 64,
            partitions: Vec::new(),
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partition_quota() {
        let mut config = small_config();
        config.partitions.push(PartitionConfig {
            name: "bounded".into(),
            max_size: 16,
            enabled: true,
        });
        assert_eq!(config.partition_quota(&config.partitions[0]), 64);
        assert_eq!(config.partition_quota(&config.partitions[1]), 16);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let json = r#"{
            "cache_line_size": 4096,
            "sector_size": 512,
            "cache_line_count": 128,
            "partitions": [{"name": "default"}]
        }"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.partitions[0].enabled);
        assert_eq!(config.effective_bucket_count(), 32);
    }
}
