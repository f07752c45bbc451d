use bytes::Bytes;

use super::codec::{malformed, max_for_width, put_u32, put_u64, put_uint, read_u32, to_u32, u64_at, uint_at};
use super::{IndexKind, Probe, STRIDE, TAG_FIXED};
use crate::error::{Result, TreeError};

const HEADER: usize = 16;
const INDEX_ENTRY: usize = 8;

/// Array of fixed-width little-endian unsigned values.
///
/// Layout:
///
/// ```text
/// [tag][index kind][width][0][len: u32][index blocks: u32][0: u32]
/// [block aggregate: u64] * index blocks
/// [value: width bytes] * len
/// ```
///
/// With [`IndexKind::Sum`] every index entry holds the sum of [`STRIDE`] consecutive values,
/// with [`IndexKind::Max`] their maximum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixedArray {
    data: Bytes,
    width: u8,
    kind: IndexKind,
    len: usize,
    blocks: usize,
}

impl FixedArray {
    /// Creates an empty array of `width`-byte values.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not in `1..=8`.
    pub fn new(width: u8, kind: IndexKind) -> Self {
        assert!((1..=8).contains(&width), "`FixedArray::new()` - `width` must be in 1..=8!");
        let mut out = Vec::with_capacity(HEADER);
        out.extend_from_slice(&[TAG_FIXED, kind as u8, width, 0]);
        out.extend_from_slice(&[0; HEADER - 4]);
        Self {
            data: Bytes::from(out),
            width,
            kind,
            len: 0,
            blocks: 0,
        }
    }

    pub fn from_values(width: u8, kind: IndexKind, values: &[u64]) -> Result<Self> {
        if !(1..=8).contains(&width) {
            return Err(malformed(format!("fixed width {width} is outside 1..=8")));
        }
        Self::encode(width, kind, values)
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < HEADER {
            return Err(malformed(format!("fixed array of {} bytes is shorter than its header", data.len())));
        }
        if data[0] != TAG_FIXED {
            return Err(malformed(format!("expected fixed array tag, found {:#04x}", data[0])));
        }
        let kind = IndexKind::from_u8(data[1])?;
        let width = data[2];
        if !(1..=8).contains(&width) {
            return Err(malformed(format!("fixed width {width} is outside 1..=8")));
        }
        let len = read_u32(&data, 4)? as usize;
        let blocks = read_u32(&data, 8)? as usize;
        if blocks != Self::blocks_for(len, kind) {
            return Err(malformed(format!("{blocks} index blocks for {len} values")));
        }
        let expected = Self::encoded_len_for(len, width, kind);
        if data.len() != expected {
            return Err(malformed(format!("fixed array is {} bytes, layout needs {expected}", data.len())));
        }
        Ok(Self {
            data,
            width,
            kind,
            len,
            blocks,
        })
    }

    fn encode(width: u8, kind: IndexKind, values: &[u64]) -> Result<Self> {
        let w = usize::from(width);
        let limit = max_for_width(w);
        if let Some(&value) = values.iter().find(|&&value| value > limit) {
            return Err(TreeError::ValueOverflow { value, width });
        }

        let len = values.len();
        let blocks = Self::blocks_for(len, kind);
        let mut out = Vec::with_capacity(Self::encoded_len_for(len, width, kind));
        out.extend_from_slice(&[TAG_FIXED, kind as u8, width, 0]);
        put_u32(&mut out, to_u32(len, "length")?);
        put_u32(&mut out, to_u32(blocks, "index blocks")?);
        put_u32(&mut out, 0);
        if kind != IndexKind::None {
            for chunk in values.chunks(STRIDE) {
                put_u64(&mut out, kind.fold(chunk.iter().copied()));
            }
        }
        for &value in values {
            put_uint(&mut out, value, w);
        }

        Ok(Self {
            data: Bytes::from(out),
            width,
            kind,
            len,
            blocks,
        })
    }

    const fn blocks_for(len: usize, kind: IndexKind) -> usize {
        match kind {
            IndexKind::None => 0,
            _ => len.div_ceil(STRIDE),
        }
    }

    /// Bytes needed to encode `len` values.
    pub const fn encoded_len_for(len: usize, width: u8, kind: IndexKind) -> usize {
        HEADER + Self::blocks_for(len, kind) * INDEX_ENTRY + len * width as usize
    }

    /// Largest number of values whose encoding fits in `budget` bytes.
    pub fn capacity_for(width: u8, kind: IndexKind, budget: usize) -> usize {
        let (mut lo, mut hi) = (0usize, budget / usize::from(width.max(1)) + 1);
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if Self::encoded_len_for(mid, width, kind) <= budget {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        if Self::encoded_len_for(lo, width, kind) <= budget { lo } else { 0 }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn index_kind(&self) -> IndexKind {
        self.kind
    }

    fn values_offset(&self) -> usize {
        HEADER + self.blocks * INDEX_ENTRY
    }

    #[inline]
    fn value(&self, idx: usize) -> u64 {
        let width = usize::from(self.width);
        uint_at(&self.data, self.values_offset() + idx * width, width)
    }

    #[inline]
    fn block_value(&self, block: usize) -> u64 {
        u64_at(&self.data, HEADER + block * INDEX_ENTRY)
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        (idx < self.len).then(|| self.value(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(|idx| self.value(idx))
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }

    /// Sum of the values in `[from, to)`.
    pub fn sum(&self, from: usize, to: usize) -> u64 {
        debug_assert!(from <= to && to <= self.len, "`FixedArray::sum()` - range out of bounds!");
        let mut acc = 0u64;
        let mut idx = from;
        while idx < to {
            if self.kind == IndexKind::Sum && idx % STRIDE == 0 && idx + STRIDE <= to {
                acc = acc.saturating_add(self.block_value(idx / STRIDE));
                idx += STRIDE;
            } else {
                acc = acc.saturating_add(self.value(idx));
                idx += 1;
            }
        }
        acc
    }

    pub fn total(&self) -> u64 {
        if self.kind == IndexKind::Sum {
            (0..self.blocks).map(|block| self.block_value(block)).fold(0, u64::saturating_add)
        } else {
            self.sum(0, self.len)
        }
    }

    pub fn max(&self) -> u64 {
        if self.kind == IndexKind::Max {
            (0..self.blocks).map(|block| self.block_value(block)).max().unwrap_or(0)
        } else {
            self.iter().max().unwrap_or(0)
        }
    }

    /// Finds the first index whose running sum (inclusive) reaches `threshold`, or exceeds it
    /// when `strict`.
    pub fn find_sum(&self, threshold: u64, strict: bool) -> Probe {
        let reached = |acc: u64| if strict { acc > threshold } else { acc >= threshold };
        let mut acc = 0u64;
        let mut idx = 0;
        while idx < self.len {
            if self.kind == IndexKind::Sum && idx % STRIDE == 0 && idx + STRIDE <= self.len {
                let next = acc.saturating_add(self.block_value(idx / STRIDE));
                if !reached(next) {
                    acc = next;
                    idx += STRIDE;
                    continue;
                }
            }
            let next = acc.saturating_add(self.value(idx));
            if reached(next) {
                return Probe::Hit { idx, before: acc };
            }
            acc = next;
            idx += 1;
        }
        Probe::Miss { total: acc }
    }

    /// Mirror of [`find_sum`](Self::find_sum) accumulating from the last value towards the first.
    pub fn find_sum_backward(&self, threshold: u64, strict: bool) -> Probe {
        let reached = |acc: u64| if strict { acc > threshold } else { acc >= threshold };
        let mut acc = 0u64;
        let mut end = self.len;
        while end > 0 {
            if self.kind == IndexKind::Sum && (end == self.len || end % STRIDE == 0) {
                let block = (end - 1) / STRIDE;
                let next = acc.saturating_add(self.block_value(block));
                if !reached(next) {
                    acc = next;
                    end = block * STRIDE;
                    continue;
                }
            }
            let idx = end - 1;
            let next = acc.saturating_add(self.value(idx));
            if reached(next) {
                return Probe::Hit { idx, before: acc };
            }
            acc = next;
            end = idx;
        }
        Probe::Miss { total: acc }
    }

    /// First index holding a value `>= value`.
    pub fn find_ge(&self, value: u64) -> Option<usize> {
        self.find_first(|candidate| candidate >= value)
    }

    /// First index holding a value `> value`.
    pub fn find_gt(&self, value: u64) -> Option<usize> {
        self.find_first(|candidate| candidate > value)
    }

    fn find_first(&self, hit: impl Fn(u64) -> bool) -> Option<usize> {
        let mut idx = 0;
        while idx < self.len {
            // A block whose maximum misses cannot contain a hit.
            if self.kind == IndexKind::Max && idx % STRIDE == 0 && !hit(self.block_value(idx / STRIDE)) {
                idx = (idx + STRIDE).min(self.len);
                continue;
            }
            if hit(self.value(idx)) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    fn rebuild(&mut self, values: &[u64], budget: usize) -> Result<()> {
        let needed = Self::encoded_len_for(values.len(), self.width, self.kind);
        if needed > budget {
            return Err(TreeError::OutOfSpace {
                needed,
                available: budget,
            });
        }
        *self = Self::encode(self.width, self.kind, values)?;
        Ok(())
    }

    pub fn set(&mut self, idx: usize, value: u64, budget: usize) -> Result<()> {
        assert!(idx < self.len, "`FixedArray::set()` - `idx` out of bounds!");
        let mut values = self.to_vec();
        values[idx] = value;
        self.rebuild(&values, budget)
    }

    pub fn insert(&mut self, at: usize, values: &[u64], budget: usize) -> Result<()> {
        assert!(at <= self.len, "`FixedArray::insert()` - `at` out of bounds!");
        let mut all = self.to_vec();
        all.splice(at..at, values.iter().copied());
        self.rebuild(&all, budget)
    }

    /// Opens `count` zeroed slots at `at`.
    pub fn insert_space(&mut self, at: usize, count: usize, budget: usize) -> Result<()> {
        assert!(at <= self.len, "`FixedArray::insert_space()` - `at` out of bounds!");
        let mut all = self.to_vec();
        all.splice(at..at, core::iter::repeat_n(0, count));
        self.rebuild(&all, budget)
    }

    pub fn remove_space(&mut self, at: usize, count: usize) -> Result<()> {
        assert!(at + count <= self.len, "`FixedArray::remove_space()` - range out of bounds!");
        let mut all = self.to_vec();
        all.drain(at..at + count);
        self.rebuild(&all, usize::MAX)
    }

    /// Moves the values from `at` onwards into a new array.
    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        assert!(at <= self.len, "`FixedArray::split_off()` - `at` out of bounds!");
        let mut left = self.to_vec();
        let right = left.split_off(at);
        let right = Self::encode(self.width, self.kind, &right)?;
        self.rebuild(&left, usize::MAX)?;
        Ok(right)
    }

    pub fn append_from(&mut self, other: &Self, budget: usize) -> Result<()> {
        if other.width != self.width || other.kind != self.kind {
            return Err(malformed("cannot append fixed arrays of different layouts"));
        }
        let mut all = self.to_vec();
        all.extend(other.iter());
        self.rebuild(&all, budget)
    }

    /// Recomputes the block index from the values.
    pub fn reindex(&mut self) -> Result<()> {
        let values = self.to_vec();
        *self = Self::encode(self.width, self.kind, &values)?;
        Ok(())
    }

    /// Checks that the block index agrees with the values.
    pub fn validate(&self) -> Result<()> {
        for (block, chunk) in self.to_vec().chunks(STRIDE).enumerate() {
            if self.kind == IndexKind::None {
                break;
            }
            let expected = self.kind.fold(chunk.iter().copied());
            let stored = self.block_value(block);
            if stored != expected {
                return Err(malformed(format!("index block {block} holds {stored}, values give {expected}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sums(values: &[u64]) -> FixedArray {
        FixedArray::from_values(8, IndexKind::Sum, values).unwrap()
    }

    #[test]
    fn empty_array() {
        let array = FixedArray::new(4, IndexKind::Sum);
        assert!(array.is_empty());
        assert_eq!(array.encoded_len(), HEADER);
        assert_eq!(array.total(), 0);
        assert_eq!(array.find_sum(0, false), Probe::Miss { total: 0 });
        assert_eq!(FixedArray::from_bytes(array.as_bytes().clone()).unwrap(), array);
    }

    #[test]
    #[should_panic(expected = "`FixedArray::new()` - `width` must be in 1..=8!")]
    fn invalid_width() {
        let _ = FixedArray::new(9, IndexKind::None);
    }

    #[test]
    fn value_overflow() {
        let err = FixedArray::from_values(1, IndexKind::None, &[255, 256]).unwrap_err();
        assert!(matches!(err, TreeError::ValueOverflow { value: 256, width: 1 }));

        let mut array = FixedArray::from_values(1, IndexKind::None, &[1]).unwrap();
        assert!(array.set(0, 1000, usize::MAX).is_err());
        assert_eq!(array.get(0), Some(1));
    }

    #[test]
    fn budget_is_enforced_before_mutation() {
        let mut array = sums(&[1, 2, 3]);
        let before = array.clone();
        let budget = array.encoded_len();
        let err = array.insert(1, &[7], budget).unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(array, before);
    }

    #[test]
    fn capacity_matches_encoding() {
        for (width, kind) in [(1, IndexKind::None), (4, IndexKind::Sum), (8, IndexKind::Max)] {
            for budget in [0, 15, 16, 17, 100, 4096] {
                let n = FixedArray::capacity_for(width, kind, budget);
                if n > 0 {
                    assert!(FixedArray::encoded_len_for(n, width, kind) <= budget);
                }
                assert!(FixedArray::encoded_len_for(n + 1, width, kind) > budget);
            }
        }
    }

    #[test]
    fn find_sum_forward_and_backward() {
        let array = sums(&[5, 0, 3, 2]);
        assert_eq!(array.find_sum(5, false), Probe::Hit { idx: 0, before: 0 });
        assert_eq!(array.find_sum(5, true), Probe::Hit { idx: 2, before: 5 });
        assert_eq!(array.find_sum(10, false), Probe::Hit { idx: 3, before: 8 });
        assert_eq!(array.find_sum(10, true), Probe::Miss { total: 10 });

        assert_eq!(array.find_sum_backward(2, false), Probe::Hit { idx: 3, before: 0 });
        assert_eq!(array.find_sum_backward(3, false), Probe::Hit { idx: 2, before: 2 });
        assert_eq!(array.find_sum_backward(5, true), Probe::Hit { idx: 0, before: 5 });
        assert_eq!(array.find_sum_backward(11, false), Probe::Miss { total: 10 });
    }

    #[test]
    fn find_ge_and_gt_on_max_index() {
        let values: Vec<u64> = (0..100).map(|i| i * 2).collect();
        let array = FixedArray::from_values(8, IndexKind::Max, &values).unwrap();
        assert_eq!(array.max(), 198);
        assert_eq!(array.find_ge(51), Some(26));
        assert_eq!(array.find_ge(52), Some(26));
        assert_eq!(array.find_gt(52), Some(27));
        assert_eq!(array.find_ge(199), None);
        assert_eq!(array.find_gt(0), Some(1));
    }

    #[test]
    fn split_and_append() {
        let values: Vec<u64> = (1..=40).collect();
        let mut left = sums(&values);
        let right = left.split_off(17).unwrap();
        assert_eq!(left.to_vec(), (1..=17).collect::<Vec<_>>());
        assert_eq!(right.to_vec(), (18..=40).collect::<Vec<_>>());
        left.validate().unwrap();
        right.validate().unwrap();

        left.append_from(&right, usize::MAX).unwrap();
        assert_eq!(left, sums(&values));
    }

    #[test]
    fn validate_detects_stale_index() {
        let array = sums(&[1, 2, 3]);
        let mut bytes = array.as_bytes().to_vec();
        bytes[HEADER] = 99;
        let corrupt = FixedArray::from_bytes(Bytes::from(bytes)).unwrap();
        assert!(corrupt.validate().is_err());
        let mut fixed = corrupt;
        fixed.reindex().unwrap();
        fixed.validate().unwrap();
        assert_eq!(fixed.total(), 6);
    }

    #[test]
    fn rejects_bad_headers() {
        let array = sums(&[1, 2, 3]);
        let bytes = array.as_bytes().to_vec();

        let mut tag = bytes.clone();
        tag[0] = 0;
        assert!(FixedArray::from_bytes(Bytes::from(tag)).is_err());

        let truncated = bytes[..bytes.len() - 1].to_vec();
        assert!(FixedArray::from_bytes(Bytes::from(truncated)).is_err());

        assert!(FixedArray::from_bytes(Bytes::from_static(&[TAG_FIXED, 0, 8])).is_err());
    }

    proptest! {
        #[test]
        fn matches_vec_model(
            values in prop::collection::vec(0u64..1000, 0..80),
            at in any::<prop::sample::Index>(),
            inserted in prop::collection::vec(0u64..1000, 0..20),
            kind in prop_oneof![Just(IndexKind::None), Just(IndexKind::Sum), Just(IndexKind::Max)],
        ) {
            let mut model = values.clone();
            let mut array = FixedArray::from_values(2, kind, &values).unwrap();
            let at = at.index(model.len() + 1);

            array.insert(at, &inserted, usize::MAX).unwrap();
            model.splice(at..at, inserted.iter().copied());
            prop_assert_eq!(array.to_vec(), model.clone());
            array.validate().unwrap();

            let total: u64 = model.iter().sum();
            prop_assert_eq!(array.sum(0, model.len()), total);
            prop_assert_eq!(array.max(), model.iter().copied().max().unwrap_or(0));

            for threshold in [0, 1, total / 2, total] {
                let expected = model.iter().scan(0u64, |acc, v| { *acc += v; Some(*acc) }).position(|acc| acc > threshold);
                match array.find_sum(threshold, true) {
                    Probe::Hit { idx, before } => {
                        prop_assert_eq!(Some(idx), expected);
                        prop_assert_eq!(before, model[..idx].iter().sum::<u64>());
                    }
                    Probe::Miss { total: t } => {
                        prop_assert_eq!(expected, None);
                        prop_assert_eq!(t, total);
                    }
                }
            }

            let removed = (model.len() - at).min(5);
            array.remove_space(at, removed).unwrap();
            model.drain(at..at + removed);
            prop_assert_eq!(array.to_vec(), model);
        }
    }
}
