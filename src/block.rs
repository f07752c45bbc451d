//! Block identifiers and block payloads.

use core::fmt;
use core::num::NonZero;

use bytes::Bytes;

/// Identifier of a block owned by a [`BlockStore`](crate::store::BlockStore).
///
/// The identifier is never zero, so `Option<BlockId>` costs nothing extra and the raw value
/// `0` can stand for "no block" inside packed child arrays.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct BlockId(NonZero<u64>);

impl BlockId {
    pub const MAX: usize = (u64::MAX - 1) as usize;

    #[inline]
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        assert!(index < Self::MAX, "`BlockId::from_index()` - `index` >= `BlockId::MAX`!");
        match NonZero::new(index as u64 + 1) {
            Some(raw) => Self(raw),
            None => unreachable!(),
        }
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn to_index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Returns the on-block representation of this identifier.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// Decodes an on-block identifier; `0` means "no block".
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZero::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A block as handed out by a store: its identifier and an immutable view of its bytes.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub data: Bytes,
}

impl Block {
    pub fn new(id: BlockId, data: Bytes) -> Self {
        Self { id, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use static_assertions::assert_eq_size;

    // Verify our assumptions about `BlockId` and the niche optimization.
    assert_eq_size!(BlockId, Option<BlockId>);
    assert_eq_size!(BlockId, u64);

    #[test]
    #[should_panic(expected = "`BlockId::from_index()` - `index` >= `BlockId::MAX`!")]
    fn invalid_block_id() {
        let _ = BlockId::from_index(BlockId::MAX);
    }

    #[test]
    fn raw_zero_is_none() {
        assert_eq!(BlockId::from_raw(0), None);
        assert_eq!(BlockId::from_raw(1), Some(BlockId::from_index(0)));
        assert_eq!(BlockId::from_index(41).to_string(), "#42");
    }

    proptest! {
        #[test]
        fn block_id_round_trip(index in 0..BlockId::MAX) {
            let id = BlockId::from_index(index);
            prop_assert_eq!(id.to_index(), index);
            prop_assert_eq!(BlockId::from_raw(id.to_raw()), Some(id));
        }
    }
}
