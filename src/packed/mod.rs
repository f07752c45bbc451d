//! Densely packed binary structures, one per column of node data.
//!
//! Every structure keeps its serialized bytes as its live representation, starts with a tag
//! byte identifying its kind and carries an index sampled every [`STRIDE`] elements (or runs)
//! that lets searches skip whole blocks without decoding them. Mutations take a byte budget
//! and fail with [`TreeError::OutOfSpace`](crate::TreeError::OutOfSpace) before changing
//! anything when the new encoding would not fit.

mod codec;
mod fixed;
mod rle;
mod vle;

pub use fixed::FixedArray;
pub use rle::{RleSequence, Run};
pub use vle::VleArray;

pub(crate) use codec::{read_u16, read_u32, read_u64};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeError};

/// Number of elements (or runs) summarized by one index entry.
pub const STRIDE: usize = 16;

pub(crate) const TAG_FIXED: u8 = 0xa1;
pub(crate) const TAG_VLE: u8 = 0xa2;
pub(crate) const TAG_RLE: u8 = 0xa3;

/// Aggregate kept by the block index of a [`FixedArray`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexKind {
    None = 0,
    Sum = 1,
    Max = 2,
}

impl IndexKind {
    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Sum),
            2 => Ok(Self::Max),
            _ => Err(TreeError::MalformedPacked(format!("unknown index kind {raw}"))),
        }
    }

    pub(crate) fn fold(self, values: impl Iterator<Item = u64>) -> u64 {
        match self {
            Self::None => 0,
            Self::Sum => values.fold(0, u64::saturating_add),
            Self::Max => values.max().unwrap_or(0),
        }
    }
}

/// Comparison used by key searches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchType {
    /// Last entry strictly less than the key.
    Lt,
    /// Last entry less than or equal to the key.
    Le,
    /// Entry equal to the key.
    Eq,
    /// First entry greater than or equal to the key.
    Ge,
    /// First entry strictly greater than the key.
    Gt,
}

/// Outcome of a threshold search over a SUM-indexed structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The threshold is reached at `idx`; `before` is the aggregate of the elements passed over
    /// before reaching it (left of `idx` forward, right of `idx` backward).
    Hit { idx: usize, before: u64 },
    /// The threshold was never reached; `total` is the aggregate of the whole structure.
    Miss { total: u64 },
}

/// One packed stream of a leaf, dispatched by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PackedStream {
    Fixed(FixedArray),
    Vle(VleArray),
    Rle(RleSequence),
}

impl PackedStream {
    /// Decodes a stream, picking the structure from its tag byte.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        match data.first() {
            Some(&TAG_FIXED) => FixedArray::from_bytes(data).map(Self::Fixed),
            Some(&TAG_VLE) => VleArray::from_bytes(data).map(Self::Vle),
            Some(&TAG_RLE) => RleSequence::from_bytes(data).map(Self::Rle),
            Some(tag) => Err(TreeError::MalformedPacked(format!("unknown stream tag {tag:#04x}"))),
            None => Err(TreeError::MalformedPacked("empty stream".to_string())),
        }
    }

    pub fn as_bytes(&self) -> &Bytes {
        match self {
            Self::Fixed(array) => array.as_bytes(),
            Self::Vle(array) => array.as_bytes(),
            Self::Rle(seq) => seq.as_bytes(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Number of logical entries (symbols for a run-length sequence).
    pub fn len(&self) -> usize {
        match self {
            Self::Fixed(array) => array.len(),
            Self::Vle(array) => array.len(),
            Self::Rle(seq) => seq.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        match self {
            Self::Fixed(array) => array.get(idx),
            Self::Vle(array) => array.get(idx),
            Self::Rle(seq) => seq.symbol(idx).map(u64::from),
        }
    }

    /// Inserts one entry value; for a run-length sequence the value is a symbol.
    pub fn insert(&mut self, at: usize, value: u64, budget: usize) -> Result<()> {
        match self {
            Self::Fixed(array) => array.insert(at, &[value], budget),
            Self::Vle(array) => array.insert(at, &[value], budget),
            Self::Rle(seq) => {
                let symbol = seq.check_symbol(value)?;
                seq.insert(at, symbol, 1, budget)
            }
        }
    }

    pub fn remove_space(&mut self, at: usize, count: usize) -> Result<()> {
        match self {
            Self::Fixed(array) => array.remove_space(at, count),
            Self::Vle(array) => array.remove_space(at, count),
            Self::Rle(seq) => seq.remove_space(at, count),
        }
    }

    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        match self {
            Self::Fixed(array) => array.split_off(at).map(Self::Fixed),
            Self::Vle(array) => array.split_off(at).map(Self::Vle),
            Self::Rle(seq) => seq.split_off(at).map(Self::Rle),
        }
    }

    pub fn append_from(&mut self, other: &Self, budget: usize) -> Result<()> {
        match (self, other) {
            (Self::Fixed(array), Self::Fixed(other)) => array.append_from(other, budget),
            (Self::Vle(array), Self::Vle(other)) => array.append_from(other, budget),
            (Self::Rle(seq), Self::Rle(other)) => seq.append_from(other, budget),
            _ => Err(TreeError::MalformedPacked("cannot append streams of different kinds".to_string())),
        }
    }

    /// Sum of values over `[from, to)`; for a sequence, the number of symbols in the range.
    pub fn sum(&self, from: usize, to: usize) -> u64 {
        match self {
            Self::Fixed(array) => array.sum(from, to),
            Self::Vle(array) => array.sum(from, to),
            Self::Rle(_) => (to - from) as u64,
        }
    }

    pub fn max(&self) -> u64 {
        match self {
            Self::Fixed(array) => array.max(),
            Self::Vle(array) => array.iter().max().unwrap_or(0),
            Self::Rle(_) => 0,
        }
    }

    /// Threshold search over the running sum of values.
    pub fn find_sum(&self, threshold: u64, strict: bool) -> Probe {
        match self {
            Self::Fixed(array) => array.find_sum(threshold, strict),
            Self::Vle(array) => array.find_sum(threshold, strict),
            Self::Rle(seq) => count_probe(seq.len(), threshold, strict),
        }
    }

    pub fn find_sum_backward(&self, threshold: u64, strict: bool) -> Probe {
        match self {
            Self::Fixed(array) => array.find_sum_backward(threshold, strict),
            Self::Vle(array) => array.find_sum_backward(threshold, strict),
            Self::Rle(seq) => match count_probe(seq.len(), threshold, strict) {
                Probe::Hit { idx, before } => Probe::Hit { idx: seq.len() - 1 - idx, before },
                miss => miss,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Fixed(array) => array.validate(),
            Self::Vle(array) => array.validate(),
            Self::Rle(seq) => seq.validate(),
        }
    }

    pub fn reindex(&mut self) -> Result<()> {
        match self {
            Self::Fixed(array) => array.reindex(),
            Self::Vle(array) => array.reindex(),
            Self::Rle(seq) => seq.reindex(),
        }
    }

    pub fn as_rle(&self) -> Option<&RleSequence> {
        match self {
            Self::Rle(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_rle_mut(&mut self) -> Option<&mut RleSequence> {
        match self {
            Self::Rle(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_fixed(&self) -> Option<&FixedArray> {
        match self {
            Self::Fixed(array) => Some(array),
            _ => None,
        }
    }
}

/// Threshold search over a stream where every element weighs one.
fn count_probe(len: usize, threshold: u64, strict: bool) -> Probe {
    let target = if strict { threshold.saturating_add(1) } else { threshold.max(1) };
    let total = len as u64;
    if target <= total {
        // `target - 1` elements precede the hit.
        Probe::Hit {
            #[allow(clippy::cast_possible_truncation)]
            idx: (target - 1) as usize,
            before: target - 1,
        }
    } else {
        Probe::Miss { total }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn stream_dispatch_by_tag() {
        let fixed = FixedArray::from_values(2, IndexKind::Sum, &[1, 2, 3]).unwrap();
        let vle = VleArray::from_values(&[300, 1]).unwrap();
        let rle = RleSequence::from_runs(1, &[(0, 4), (1, 2)]).unwrap();

        for (stream, len) in [
            (PackedStream::Fixed(fixed), 3),
            (PackedStream::Vle(vle), 2),
            (PackedStream::Rle(rle), 6),
        ] {
            let decoded = PackedStream::from_bytes(stream.as_bytes().clone()).unwrap();
            assert_eq!(decoded, stream);
            assert_eq!(decoded.len(), len);
        }

        assert!(PackedStream::from_bytes(Bytes::from_static(&[0x00, 1, 2])).is_err());
        assert!(PackedStream::from_bytes(Bytes::new()).is_err());
    }

    #[test]
    fn mismatched_append_fails() {
        let mut fixed = PackedStream::Fixed(FixedArray::new(8, IndexKind::None));
        let vle = PackedStream::Vle(VleArray::new());
        assert!(fixed.append_from(&vle, usize::MAX).is_err());
    }

    #[test]
    fn sequence_streams_count_symbols() {
        let seq = PackedStream::Rle(RleSequence::from_runs(1, &[(1, 10)]).unwrap());
        assert_eq!(seq.sum(2, 7), 5);
        assert_eq!(seq.find_sum(3, true), Probe::Hit { idx: 3, before: 3 });
        assert_eq!(seq.find_sum(3, false), Probe::Hit { idx: 2, before: 2 });
        assert_eq!(seq.find_sum_backward(1, false), Probe::Hit { idx: 9, before: 0 });
        assert_eq!(seq.find_sum(10, true), Probe::Miss { total: 10 });
    }

    #[test]
    fn index_kind_fold() {
        let values = [3u64, 9, 4];
        assert_eq!(IndexKind::Sum.fold(values.iter().copied()), 16);
        assert_eq!(IndexKind::Max.fold(values.iter().copied()), 9);
        assert_eq!(IndexKind::None.fold(values.iter().copied()), 0);
        assert_eq!(IndexKind::Max.fold(core::iter::empty()), 0);
        assert!(IndexKind::from_u8(7).is_err());
    }
}
