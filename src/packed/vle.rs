use bytes::Bytes;
use smallvec::SmallVec;

use super::codec::{malformed, put_u32, put_u64, put_varint, read_u32, read_varint, to_u32, u32_at, u64_at, varint_at, varint_len};
use super::{Probe, STRIDE, TAG_VLE};
use crate::error::{Result, TreeError};

const HEADER: usize = 16;
const INDEX_ENTRY: usize = 12;

type BlockValues = SmallVec<[u64; STRIDE]>;

/// Array of LEB128-coded unsigned values with a sampled offset and sum index.
///
/// Layout:
///
/// ```text
/// [tag][0; 3][len: u32][index blocks: u32][data len: u32]
/// ([data offset: u32][block sum: u64]) * index blocks
/// [varint] * len
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VleArray {
    data: Bytes,
    len: usize,
    blocks: usize,
}

impl Default for VleArray {
    fn default() -> Self {
        Self::new()
    }
}

impl VleArray {
    pub fn new() -> Self {
        let mut out = Vec::with_capacity(HEADER);
        out.extend_from_slice(&[TAG_VLE, 0, 0, 0]);
        out.extend_from_slice(&[0; HEADER - 4]);
        Self {
            data: Bytes::from(out),
            len: 0,
            blocks: 0,
        }
    }

    pub fn from_values(values: &[u64]) -> Result<Self> {
        let blocks = values.len().div_ceil(STRIDE);
        let data_len: usize = values.iter().map(|&value| varint_len(value)).sum();
        let mut out = Vec::with_capacity(HEADER + blocks * INDEX_ENTRY + data_len);
        out.extend_from_slice(&[TAG_VLE, 0, 0, 0]);
        put_u32(&mut out, to_u32(values.len(), "length")?);
        put_u32(&mut out, to_u32(blocks, "index blocks")?);
        put_u32(&mut out, to_u32(data_len, "data length")?);

        let mut offset = 0usize;
        for chunk in values.chunks(STRIDE) {
            put_u32(&mut out, to_u32(offset, "block offset")?);
            put_u64(&mut out, chunk.iter().copied().fold(0, u64::saturating_add));
            offset += chunk.iter().map(|&value| varint_len(value)).sum::<usize>();
        }
        for &value in values {
            put_varint(&mut out, value);
        }

        Ok(Self {
            data: Bytes::from(out),
            len: values.len(),
            blocks,
        })
    }

    /// Decodes an array, checking that every varint is well formed.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < HEADER {
            return Err(malformed(format!("vle array of {} bytes is shorter than its header", data.len())));
        }
        if data[0] != TAG_VLE {
            return Err(malformed(format!("expected vle array tag, found {:#04x}", data[0])));
        }
        let len = read_u32(&data, 4)? as usize;
        let blocks = read_u32(&data, 8)? as usize;
        let data_len = read_u32(&data, 12)? as usize;
        if blocks != len.div_ceil(STRIDE) {
            return Err(malformed(format!("{blocks} index blocks for {len} values")));
        }
        let start = HEADER + blocks * INDEX_ENTRY;
        if data.len() != start + data_len {
            return Err(malformed(format!("vle array is {} bytes, layout needs {}", data.len(), start + data_len)));
        }

        let mut at = start;
        for idx in 0..len {
            if idx % STRIDE == 0 {
                let offset = read_u32(&data, HEADER + (idx / STRIDE) * INDEX_ENTRY)? as usize;
                if start + offset != at {
                    return Err(malformed(format!("index block {} points at {offset}", idx / STRIDE)));
                }
            }
            let (_, n) = read_varint(&data, at)?;
            at += n;
        }
        if at != data.len() {
            return Err(malformed("trailing bytes after last vle value"));
        }

        Ok(Self { data, len, blocks })
    }

    /// Bytes needed to encode `values`.
    pub fn encoded_len_for(values: &[u64]) -> usize {
        HEADER + values.len().div_ceil(STRIDE) * INDEX_ENTRY + values.iter().map(|&value| varint_len(value)).sum::<usize>()
    }

    /// Largest number of single-byte values whose encoding fits in `budget` bytes.
    pub fn capacity_for(budget: usize) -> usize {
        let per_block = STRIDE + INDEX_ENTRY;
        let Some(room) = budget.checked_sub(HEADER) else {
            return 0;
        };
        let full = room / per_block;
        let rest = room % per_block;
        full * STRIDE + rest.saturating_sub(INDEX_ENTRY).min(STRIDE - 1)
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

    fn data_start(&self) -> usize {
        HEADER + self.blocks * INDEX_ENTRY
    }

    fn block_offset(&self, block: usize) -> usize {
        self.data_start() + u32_at(&self.data, HEADER + block * INDEX_ENTRY) as usize
    }

    fn block_sum(&self, block: usize) -> u64 {
        u64_at(&self.data, HEADER + block * INDEX_ENTRY + 4)
    }

    fn block_len(&self, block: usize) -> usize {
        (self.len - block * STRIDE).min(STRIDE)
    }

    fn block_values(&self, block: usize) -> BlockValues {
        let mut at = self.block_offset(block);
        let mut values = BlockValues::new();
        for _ in 0..self.block_len(block) {
            let (value, n) = varint_at(&self.data, at);
            values.push(value);
            at += n;
        }
        values
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        (idx < self.len).then(|| self.block_values(idx / STRIDE)[idx % STRIDE])
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let mut at = self.data_start();
        (0..self.len).map(move |_| {
            let (value, n) = varint_at(&self.data, at);
            at += n;
            value
        })
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }

    /// Sum of the values in `[from, to)`.
    pub fn sum(&self, from: usize, to: usize) -> u64 {
        debug_assert!(from <= to && to <= self.len, "`VleArray::sum()` - range out of bounds!");
        let mut acc = 0u64;
        let mut idx = from;
        while idx < to {
            let block = idx / STRIDE;
            if idx % STRIDE == 0 && idx + STRIDE <= to {
                acc = acc.saturating_add(self.block_sum(block));
                idx += STRIDE;
                continue;
            }
            let values = self.block_values(block);
            let end = ((block + 1) * STRIDE).min(to);
            acc = values[idx % STRIDE..end - block * STRIDE].iter().copied().fold(acc, u64::saturating_add);
            idx = end;
        }
        acc
    }

    pub fn total(&self) -> u64 {
        (0..self.blocks).map(|block| self.block_sum(block)).fold(0, u64::saturating_add)
    }

    /// Finds the first index whose running sum (inclusive) reaches `threshold`, or exceeds it
    /// when `strict`.
    pub fn find_sum(&self, threshold: u64, strict: bool) -> Probe {
        let reached = |acc: u64| if strict { acc > threshold } else { acc >= threshold };
        let mut acc = 0u64;
        for block in 0..self.blocks {
            let next = acc.saturating_add(self.block_sum(block));
            if !reached(next) {
                acc = next;
                continue;
            }
            for (i, value) in self.block_values(block).into_iter().enumerate() {
                let next = acc.saturating_add(value);
                if reached(next) {
                    return Probe::Hit {
                        idx: block * STRIDE + i,
                        before: acc,
                    };
                }
                acc = next;
            }
        }
        Probe::Miss { total: acc }
    }

    pub fn find_sum_backward(&self, threshold: u64, strict: bool) -> Probe {
        let reached = |acc: u64| if strict { acc > threshold } else { acc >= threshold };
        let mut acc = 0u64;
        for block in (0..self.blocks).rev() {
            let next = acc.saturating_add(self.block_sum(block));
            if !reached(next) {
                acc = next;
                continue;
            }
            for (i, value) in self.block_values(block).into_iter().enumerate().rev() {
                let next = acc.saturating_add(value);
                if reached(next) {
                    return Probe::Hit {
                        idx: block * STRIDE + i,
                        before: acc,
                    };
                }
                acc = next;
            }
        }
        Probe::Miss { total: acc }
    }

    fn rebuild(&mut self, values: &[u64], budget: usize) -> Result<()> {
        let needed = Self::encoded_len_for(values);
        if needed > budget {
            return Err(TreeError::OutOfSpace {
                needed,
                available: budget,
            });
        }
        *self = Self::from_values(values)?;
        Ok(())
    }

    pub fn set(&mut self, idx: usize, value: u64, budget: usize) -> Result<()> {
        assert!(idx < self.len, "`VleArray::set()` - `idx` out of bounds!");
        let mut values = self.to_vec();
        values[idx] = value;
        self.rebuild(&values, budget)
    }

    pub fn insert(&mut self, at: usize, values: &[u64], budget: usize) -> Result<()> {
        assert!(at <= self.len, "`VleArray::insert()` - `at` out of bounds!");
        let mut all = self.to_vec();
        all.splice(at..at, values.iter().copied());
        self.rebuild(&all, budget)
    }

    pub fn insert_space(&mut self, at: usize, count: usize, budget: usize) -> Result<()> {
        assert!(at <= self.len, "`VleArray::insert_space()` - `at` out of bounds!");
        let mut all = self.to_vec();
        all.splice(at..at, core::iter::repeat_n(0, count));
        self.rebuild(&all, budget)
    }

    pub fn remove_space(&mut self, at: usize, count: usize) -> Result<()> {
        assert!(at + count <= self.len, "`VleArray::remove_space()` - range out of bounds!");
        let mut all = self.to_vec();
        all.drain(at..at + count);
        self.rebuild(&all, usize::MAX)
    }

    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        assert!(at <= self.len, "`VleArray::split_off()` - `at` out of bounds!");
        let mut left = self.to_vec();
        let right = Self::from_values(&left.split_off(at))?;
        self.rebuild(&left, usize::MAX)?;
        Ok(right)
    }

    pub fn append_from(&mut self, other: &Self, budget: usize) -> Result<()> {
        let mut all = self.to_vec();
        all.extend(other.iter());
        self.rebuild(&all, budget)
    }

    pub fn reindex(&mut self) -> Result<()> {
        *self = Self::from_values(&self.to_vec())?;
        Ok(())
    }

    /// Checks that the offset and sum index agrees with the values.
    pub fn validate(&self) -> Result<()> {
        let values = self.to_vec();
        let mut offset = 0usize;
        for (block, chunk) in values.chunks(STRIDE).enumerate() {
            let stored_offset = self.block_offset(block) - self.data_start();
            if stored_offset != offset {
                return Err(malformed(format!("index block {block} points at {stored_offset}, expected {offset}")));
            }
            let expected = chunk.iter().copied().fold(0, u64::saturating_add);
            if self.block_sum(block) != expected {
                return Err(malformed(format!(
                    "index block {block} holds sum {}, values give {expected}",
                    self.block_sum(block)
                )));
            }
            offset += chunk.iter().map(|&value| varint_len(value)).sum::<usize>();
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_array() {
        let array = VleArray::new();
        assert!(array.is_empty());
        assert_eq!(array.total(), 0);
        assert_eq!(VleArray::from_bytes(array.as_bytes().clone()).unwrap(), array);
        assert_eq!(VleArray::from_values(&[]).unwrap(), array);
    }

    #[test]
    fn mixed_widths() {
        let values = [0, 127, 128, 1 << 20, u64::MAX];
        let array = VleArray::from_values(&values).unwrap();
        assert_eq!(array.to_vec(), values);
        assert_eq!(array.get(3), Some(1 << 20));
        assert_eq!(array.get(5), None);
        assert_eq!(array.encoded_len(), HEADER + INDEX_ENTRY + 1 + 1 + 2 + 3 + 10);
    }

    #[test]
    fn capacity_is_exact_for_small_values() {
        for budget in [0, 16, 28, 29, 44, 45, 100, 4096] {
            let n = VleArray::capacity_for(budget);
            if n > 0 {
                assert!(VleArray::encoded_len_for(&vec![1u64; n]) <= budget);
            }
            let more = vec![1u64; n + 1];
            assert!(VleArray::encoded_len_for(&more) > budget);
        }
    }

    #[test]
    fn out_of_space_leaves_array_untouched() {
        let mut array = VleArray::from_values(&[1, 2, 3]).unwrap();
        let before = array.clone();
        let err = array.insert(0, &[u64::MAX], array.encoded_len() + 5).unwrap_err();
        assert!(matches!(err, TreeError::OutOfSpace { .. }));
        assert_eq!(array, before);
    }

    #[test]
    fn rejects_corrupt_bytes() {
        let array = VleArray::from_values(&[300, 5]).unwrap();
        let mut bytes = array.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] |= 0x80;
        assert!(VleArray::from_bytes(Bytes::from(bytes)).is_err());

        let mut bytes = array.as_bytes().to_vec();
        bytes.push(0);
        assert!(VleArray::from_bytes(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn find_sum_over_blocks() {
        let values: Vec<u64> = (0..50).map(|i| i % 3).collect();
        let array = VleArray::from_values(&values).unwrap();
        let total: u64 = values.iter().sum();
        assert_eq!(array.total(), total);
        assert_eq!(array.find_sum(total, false), Probe::Hit { idx: 49, before: total - 1 });
        assert_eq!(array.find_sum(total, true), Probe::Miss { total });
        assert_eq!(array.find_sum(1, false), Probe::Hit { idx: 1, before: 0 });
        assert_eq!(array.find_sum_backward(1, false), Probe::Hit { idx: 49, before: 0 });
        assert_eq!(array.find_sum_backward(2, false), Probe::Hit { idx: 47, before: 1 });
        assert_eq!(array.find_sum_backward(4, false), Probe::Hit { idx: 46, before: 3 });
    }

    proptest! {
        #[test]
        fn matches_vec_model(
            values in prop::collection::vec(any::<u32>().prop_map(u64::from), 0..70),
            at in any::<prop::sample::Index>(),
            from in any::<prop::sample::Index>(),
        ) {
            let mut array = VleArray::from_values(&values).unwrap();
            array.validate().unwrap();
            let mut model = values;

            let at = at.index(model.len() + 1);
            array.insert(at, &[42, 1 << 40], usize::MAX).unwrap();
            model.splice(at..at, [42, 1 << 40]);
            prop_assert_eq!(array.to_vec(), model.clone());
            prop_assert_eq!(VleArray::from_bytes(array.as_bytes().clone()).unwrap(), array.clone());

            let from = from.index(model.len() + 1);
            prop_assert_eq!(array.sum(from, model.len()), model[from..].iter().sum::<u64>());
            prop_assert_eq!(array.sum(0, from), model[..from].iter().sum::<u64>());

            let right = array.split_off(from).unwrap();
            prop_assert_eq!(array.to_vec(), model[..from].to_vec());
            prop_assert_eq!(right.to_vec(), model[from..].to_vec());
            array.append_from(&right, usize::MAX).unwrap();
            array.validate().unwrap();
            prop_assert_eq!(array.to_vec(), model);
        }
    }
}
