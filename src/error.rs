//! Error types for the tree engine.

use thiserror::Error;

use crate::block::BlockId;

/// Result type alias using [`TreeError`].
pub type Result<T> = core::result::Result<T, TreeError>;

/// Errors that can occur in tree, packed structure and store operations.
///
/// A missing key or an out-of-range position is never reported through this type;
/// those are ordinary outcomes of the search operations.
#[derive(Debug, Error)]
pub enum TreeError {
    // Capacity errors
    #[error("Out of space: need {needed} bytes, {available} available")]
    OutOfSpace { needed: usize, available: usize },

    #[error("Entry too large: {size} bytes does not fit in an empty node ({capacity} usable bytes)")]
    EntryTooLarge { size: usize, capacity: usize },

    #[error("Value {value} does not fit in {width} bytes")]
    ValueOverflow { value: u64, width: u8 },

    #[error("Symbol {symbol} is outside the alphabet of {alphabet} symbols")]
    InvalidSymbol { symbol: u64, alphabet: usize },

    // Format errors
    #[error("Malformed packed structure: {0}")]
    MalformedPacked(String),

    #[error("Block {block} has an invalid format: {reason}")]
    Format { block: BlockId, reason: String },

    #[error("Schema mismatch: expected schema {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },

    // Store errors
    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Block {0} is sealed and cannot be modified")]
    ImmutableBlock(BlockId),

    #[error("Block store is full ({0} blocks)")]
    StoreFull(usize),

    #[error("Store error: {0}")]
    Store(String),

    // Catalogue errors
    #[error("Schema not found: {0}")]
    UnknownSchema(String),

    #[error("Schema already registered: {0}")]
    DuplicateSchema(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot already exists: {0}")]
    SnapshotExists(String),

    // Usage errors
    #[error("Entry has {actual} values, schema expects {expected}")]
    EntryArity { expected: usize, actual: usize },

    #[error("Operation `{operation}` is not supported by schema {schema}")]
    Unsupported { schema: String, operation: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TreeError {
    /// Returns true for the recoverable capacity condition the split engine consumes.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, TreeError::OutOfSpace { .. })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn out_of_space_display() {
        let err = TreeError::OutOfSpace { needed: 40, available: 12 };
        assert_eq!(err.to_string(), "Out of space: need 40 bytes, 12 available");
        assert!(err.is_out_of_space());
    }

    #[test]
    fn format_display_names_block() {
        let err = TreeError::Format {
            block: BlockId::from_index(6),
            reason: "bad magic".to_string(),
        };
        assert_eq!(err.to_string(), "Block #7 has an invalid format: bad magic");
        assert!(!err.is_out_of_space());
    }

    #[test]
    fn usage_errors_display() {
        let err = TreeError::EntryArity { expected: 2, actual: 1 };
        assert_eq!(err.to_string(), "Entry has 1 values, schema expects 2");

        let err = TreeError::Unsupported {
            schema: "vector".to_string(),
            operation: "find",
        };
        assert_eq!(err.to_string(), "Operation `find` is not supported by schema vector");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TreeError>();
    }
}
