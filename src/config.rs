//! Configuration for block stores and trees.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};

/// Default block size in bytes (4 KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest block size a store accepts. A block must hold a node header plus a few entries.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Largest block size a store accepts (1 MB).
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Configuration of the in-memory block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Capacity of every block in bytes.
    pub block_size: usize,
    /// Maximum number of live blocks.
    pub max_blocks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: (u32::MAX - 1) as usize,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(TreeError::Config(format!(
                "block_size {} is outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                self.block_size
            )));
        }
        if self.max_blocks == 0 {
            return Err(TreeError::Config("max_blocks must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// What happens to under-filled nodes after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Only empty nodes are removed; partially filled nodes stay as they are.
    #[default]
    Lazy,
    /// A node below `min_fill_percent` is merged with a sibling whenever the result fits in a block.
    Eager,
}

/// Per-tree behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Merge policy applied after removals.
    pub merge_policy: MergePolicy,
    /// Fill level (percentage of the block size) below which a node counts as under-filled.
    pub min_fill_percent: u8,
    /// Number of entries pulled from a producer per fill cycle.
    pub batch_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::Lazy,
            min_fill_percent: 25,
            batch_size: 256,
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_fill_percent > 50 {
            return Err(TreeError::Config(format!(
                "min_fill_percent {} is above 50",
                self.min_fill_percent
            )));
        }
        if self.batch_size == 0 {
            return Err(TreeError::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Returns true when a node of `used` bytes is under-filled in a block of `block_size` bytes.
    pub(crate) fn is_underfilled(&self, used: usize, block_size: usize) -> bool {
        used * 100 < block_size * usize::from(self.min_fill_percent)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, 4096);
        assert!(config.max_blocks > 1_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn store_config_rejects_block_sizes() {
        let small = StoreConfig { block_size: 128, ..StoreConfig::default() };
        assert!(matches!(small.validate(), Err(TreeError::Config(_))));

        let large = StoreConfig { block_size: MAX_BLOCK_SIZE + 1, ..StoreConfig::default() };
        assert!(matches!(large.validate(), Err(TreeError::Config(_))));

        let none = StoreConfig { max_blocks: 0, ..StoreConfig::default() };
        assert!(none.validate().is_err());
    }

    #[test]
    fn tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.merge_policy, MergePolicy::Lazy);
        assert_eq!(config.min_fill_percent, 25);
        assert_eq!(config.batch_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tree_config_validation() {
        let config = TreeConfig { min_fill_percent: 60, ..TreeConfig::default() };
        assert!(config.validate().is_err());

        let config = TreeConfig { batch_size: 0, ..TreeConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn underfill_threshold() {
        let config = TreeConfig::default();
        assert!(config.is_underfilled(1023, 4096));
        assert!(!config.is_underfilled(1024, 4096));
    }

    #[test]
    fn config_serde_round_trip() {
        let config = TreeConfig {
            merge_policy: MergePolicy::Eager,
            min_fill_percent: 40,
            batch_size: 16,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TreeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let json = serde_json::to_string(&StoreConfig::default()).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StoreConfig::default());
    }
}
