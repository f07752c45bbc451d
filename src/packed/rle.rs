use bytes::Bytes;
use smallvec::SmallVec;

use super::codec::{malformed, put_u32, put_u64, put_varint, read_u32, read_u64, read_varint, to_u32, u32_at, u64_at, varint_at, varint_len};
use super::{STRIDE, TAG_RLE};
use crate::error::{Result, TreeError};

const HEADER: usize = 24;

/// A run of `len` copies of `symbol`.
pub type Run = (u8, usize);

type BlockRuns = SmallVec<[Run; STRIDE]>;

/// Run-length coded symbol sequence with rank and select support.
///
/// Symbols use 1 to 4 bits. Each run is one varint holding `(len << bits) | symbol`; adjacent
/// runs always carry different symbols. Every [`STRIDE`] runs the index records the byte
/// offset of the block, the number of symbols it covers and per-symbol counts.
///
/// Layout:
///
/// ```text
/// [tag][bits][0; 2][index blocks: u32][data len: u32][runs: u32][len: u64]
/// ([data offset: u32][block len: u64][count: u64] * alphabet) * index blocks
/// [varint] * runs
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RleSequence {
    data: Bytes,
    bits: u8,
    len: usize,
    runs: usize,
    blocks: usize,
}

impl RleSequence {
    /// # Panics
    ///
    /// Panics if `bits` is not in `1..=4`.
    pub fn new(bits: u8) -> Self {
        assert!((1..=4).contains(&bits), "`RleSequence::new()` - `bits` must be in 1..=4!");
        let mut out = Vec::with_capacity(HEADER);
        out.extend_from_slice(&[TAG_RLE, bits, 0, 0]);
        out.extend_from_slice(&[0; HEADER - 4]);
        Self {
            data: Bytes::from(out),
            bits,
            len: 0,
            runs: 0,
            blocks: 0,
        }
    }

    /// Builds a sequence from runs; zero-length runs are dropped and equal neighbours merged.
    pub fn from_runs(bits: u8, runs: &[Run]) -> Result<Self> {
        if !(1..=4).contains(&bits) {
            return Err(malformed(format!("symbol width {bits} is outside 1..=4")));
        }
        let alphabet = 1usize << bits;
        if let Some(&(symbol, _)) = runs.iter().find(|(symbol, _)| usize::from(*symbol) >= alphabet) {
            return Err(TreeError::InvalidSymbol {
                symbol: u64::from(symbol),
                alphabet,
            });
        }
        Self::encode(bits, &normalize(runs.iter().copied()))
    }

    fn encode(bits: u8, runs: &[Run]) -> Result<Self> {
        let alphabet = 1usize << bits;
        let limit = u64::MAX >> bits;
        let mut codes = Vec::with_capacity(runs.len());
        for &(symbol, len) in runs {
            let len = len as u64;
            if len > limit {
                return Err(TreeError::ValueOverflow { value: len, width: 8 });
            }
            codes.push((len << bits) | u64::from(symbol));
        }

        let blocks = runs.len().div_ceil(STRIDE);
        let data_len: usize = codes.iter().map(|&code| varint_len(code)).sum();
        let total: usize = runs.iter().map(|&(_, len)| len).sum();
        let mut out = Vec::with_capacity(Self::layout_len(bits, runs.len(), data_len));
        out.extend_from_slice(&[TAG_RLE, bits, 0, 0]);
        put_u32(&mut out, to_u32(blocks, "index blocks")?);
        put_u32(&mut out, to_u32(data_len, "data length")?);
        put_u32(&mut out, to_u32(runs.len(), "run count")?);
        put_u64(&mut out, total as u64);

        let mut offset = 0usize;
        for (chunk, chunk_codes) in runs.chunks(STRIDE).zip(codes.chunks(STRIDE)) {
            let mut counts = vec![0u64; alphabet];
            for &(symbol, len) in chunk {
                counts[usize::from(symbol)] += len as u64;
            }
            put_u32(&mut out, to_u32(offset, "block offset")?);
            put_u64(&mut out, counts.iter().sum());
            for count in counts {
                put_u64(&mut out, count);
            }
            offset += chunk_codes.iter().map(|&code| varint_len(code)).sum::<usize>();
        }
        for code in codes {
            put_varint(&mut out, code);
        }

        Ok(Self {
            data: Bytes::from(out),
            bits,
            len: total,
            runs: runs.len(),
            blocks,
        })
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < HEADER {
            return Err(malformed(format!("sequence of {} bytes is shorter than its header", data.len())));
        }
        if data[0] != TAG_RLE {
            return Err(malformed(format!("expected sequence tag, found {:#04x}", data[0])));
        }
        let bits = data[1];
        if !(1..=4).contains(&bits) {
            return Err(malformed(format!("symbol width {bits} is outside 1..=4")));
        }
        let blocks = read_u32(&data, 4)? as usize;
        let data_len = read_u32(&data, 8)? as usize;
        let runs = read_u32(&data, 12)? as usize;
        let len = usize::try_from(read_u64(&data, 16)?).map_err(|_| malformed("sequence length overflows usize"))?;
        if blocks != runs.div_ceil(STRIDE) {
            return Err(malformed(format!("{blocks} index blocks for {runs} runs")));
        }
        let expected = Self::layout_len(bits, runs, data_len);
        if data.len() != expected {
            return Err(malformed(format!("sequence is {} bytes, layout needs {expected}", data.len())));
        }

        let entry = Self::entry_len(bits);
        let start = HEADER + blocks * entry;
        let mut at = start;
        let mut total = 0usize;
        for run in 0..runs {
            if run % STRIDE == 0 {
                let offset = read_u32(&data, HEADER + (run / STRIDE) * entry)? as usize;
                if start + offset != at {
                    return Err(malformed(format!("index block {} points at {offset}", run / STRIDE)));
                }
            }
            let (code, n) = read_varint(&data, at)?;
            let run_len = usize::try_from(code >> bits).map_err(|_| malformed("run length overflows usize"))?;
            if run_len == 0 {
                return Err(malformed(format!("run {run} is empty")));
            }
            total = total.checked_add(run_len).ok_or_else(|| malformed("sequence length overflows usize"))?;
            at += n;
        }
        if at != data.len() || total != len {
            return Err(malformed(format!("runs cover {total} symbols, header says {len}")));
        }

        Ok(Self {
            data,
            bits,
            len,
            runs,
            blocks,
        })
    }

    const fn entry_len(bits: u8) -> usize {
        4 + 8 + 8 * (1usize << bits)
    }

    const fn layout_len(bits: u8, runs: usize, data_len: usize) -> usize {
        HEADER + runs.div_ceil(STRIDE) * Self::entry_len(bits) + data_len
    }

    /// Bytes needed to encode `runs` (already normalized).
    pub fn encoded_len_for(bits: u8, runs: &[Run]) -> usize {
        let data_len = runs
            .iter()
            .map(|&(symbol, len)| varint_len(((len as u64) << bits) | u64::from(symbol)))
            .sum();
        Self::layout_len(bits, runs.len(), data_len)
    }

    /// Largest number of short runs whose encoding fits in `budget` bytes.
    pub fn capacity_for(bits: u8, budget: usize) -> usize {
        let entry = Self::entry_len(bits);
        let Some(room) = budget.checked_sub(HEADER) else {
            return 0;
        };
        let per_block = STRIDE + entry;
        let full = room / per_block;
        let rest = room % per_block;
        full * STRIDE + rest.saturating_sub(entry).min(STRIDE - 1)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn alphabet(&self) -> usize {
        1 << self.bits
    }

    pub fn run_count(&self) -> usize {
        self.runs
    }

    /// Converts an entry value into a symbol of this sequence's alphabet.
    pub fn check_symbol(&self, value: u64) -> Result<u8> {
        match u8::try_from(value) {
            Ok(symbol) if usize::from(symbol) < self.alphabet() => Ok(symbol),
            _ => Err(TreeError::InvalidSymbol {
                symbol: value,
                alphabet: self.alphabet(),
            }),
        }
    }

    fn entry_at(&self, block: usize) -> usize {
        HEADER + block * Self::entry_len(self.bits)
    }

    fn data_start(&self) -> usize {
        self.entry_at(self.blocks)
    }

    fn block_len(&self, block: usize) -> usize {
        u64_at(&self.data, self.entry_at(block) + 4) as usize
    }

    fn block_count(&self, block: usize, symbol: u8) -> usize {
        u64_at(&self.data, self.entry_at(block) + 12 + 8 * usize::from(symbol)) as usize
    }

    fn block_runs(&self, block: usize) -> BlockRuns {
        let mut at = self.data_start() + u32_at(&self.data, self.entry_at(block)) as usize;
        let mask = (1u64 << self.bits) - 1;
        let mut runs = BlockRuns::new();
        for _ in block * STRIDE..((block + 1) * STRIDE).min(self.runs) {
            let (code, n) = varint_at(&self.data, at);
            #[allow(clippy::cast_possible_truncation)]
            runs.push(((code & mask) as u8, (code >> self.bits) as usize));
            at += n;
        }
        runs
    }

    pub fn runs(&self) -> Vec<Run> {
        (0..self.blocks).flat_map(|block| self.block_runs(block)).collect()
    }

    /// Symbol at `pos`.
    pub fn symbol(&self, pos: usize) -> Option<u8> {
        if pos >= self.len {
            return None;
        }
        let mut start = 0;
        for block in 0..self.blocks {
            let len = self.block_len(block);
            if pos < start + len {
                for (symbol, run) in self.block_runs(block) {
                    if pos < start + run {
                        return Some(symbol);
                    }
                    start += run;
                }
            }
            start += len;
        }
        None
    }

    /// Number of occurrences of `symbol` in `[0, pos)`; `pos` past the end counts everything.
    pub fn rank(&self, pos: usize, symbol: u8) -> usize {
        let pos = pos.min(self.len);
        let mut start = 0;
        let mut rank = 0;
        for block in 0..self.blocks {
            let len = self.block_len(block);
            if start + len <= pos {
                rank += self.block_count(block, symbol);
                start += len;
                continue;
            }
            for (sym, run) in self.block_runs(block) {
                if start >= pos {
                    break;
                }
                if sym == symbol {
                    rank += run.min(pos - start);
                }
                start += run;
            }
            break;
        }
        rank
    }

    /// Number of occurrences of `symbol` in `[from, to)`.
    pub fn rank_range(&self, from: usize, to: usize, symbol: u8) -> usize {
        self.rank(to, symbol) - self.rank(from, symbol)
    }

    /// Total number of occurrences of `symbol`.
    pub fn count(&self, symbol: u8) -> usize {
        (0..self.blocks).map(|block| self.block_count(block, symbol)).sum()
    }

    /// Position of the `k`-th (1-based) occurrence of `symbol`.
    pub fn select(&self, k: usize, symbol: u8) -> Option<usize> {
        if k == 0 {
            return None;
        }
        let mut seen = 0;
        let mut start = 0;
        for block in 0..self.blocks {
            let count = self.block_count(block, symbol);
            if seen + count < k {
                seen += count;
                start += self.block_len(block);
                continue;
            }
            for (sym, run) in self.block_runs(block) {
                if sym == symbol {
                    if seen + run >= k {
                        return Some(start + (k - seen - 1));
                    }
                    seen += run;
                }
                start += run;
            }
        }
        None
    }

    /// Position of the `k`-th (1-based) occurrence of `symbol` counting from the end.
    pub fn select_backward(&self, k: usize, symbol: u8) -> Option<usize> {
        if k == 0 {
            return None;
        }
        let mut seen = 0;
        let mut end = self.len;
        for block in (0..self.blocks).rev() {
            let count = self.block_count(block, symbol);
            if seen + count < k {
                seen += count;
                end -= self.block_len(block);
                continue;
            }
            for (sym, run) in self.block_runs(block).into_iter().rev() {
                let start = end - run;
                if sym == symbol {
                    if seen + run >= k {
                        return Some(end - (k - seen));
                    }
                    seen += run;
                }
                end = start;
            }
        }
        None
    }

    fn rebuild(&mut self, runs: &[Run], budget: usize) -> Result<()> {
        let needed = Self::encoded_len_for(self.bits, runs);
        if needed > budget {
            return Err(TreeError::OutOfSpace {
                needed,
                available: budget,
            });
        }
        *self = Self::encode(self.bits, runs)?;
        Ok(())
    }

    pub fn append_run(&mut self, symbol: u8, len: usize, budget: usize) -> Result<()> {
        self.insert(self.len, symbol, len, budget)
    }

    /// Inserts `len` copies of `symbol` at `at`.
    pub fn insert(&mut self, at: usize, symbol: u8, len: usize, budget: usize) -> Result<()> {
        assert!(at <= self.len, "`RleSequence::insert()` - `at` out of bounds!");
        self.check_symbol(u64::from(symbol))?;
        let (mut left, right) = split_runs(&self.runs(), at);
        left.push((symbol, len));
        left.extend(right);
        self.rebuild(&normalize(left), budget)
    }

    /// Inserts `count` zero symbols at `at`.
    pub fn insert_space(&mut self, at: usize, count: usize, budget: usize) -> Result<()> {
        self.insert(at, 0, count, budget)
    }

    pub fn remove_space(&mut self, at: usize, count: usize) -> Result<()> {
        assert!(at + count <= self.len, "`RleSequence::remove_space()` - range out of bounds!");
        let (mut left, right) = split_runs(&self.runs(), at);
        let (_, rest) = split_runs(&right, count);
        left.extend(rest);
        self.rebuild(&normalize(left), usize::MAX)
    }

    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        assert!(at <= self.len, "`RleSequence::split_off()` - `at` out of bounds!");
        let (left, right) = split_runs(&self.runs(), at);
        let right = Self::encode(self.bits, &right)?;
        self.rebuild(&left, usize::MAX)?;
        Ok(right)
    }

    pub fn append_from(&mut self, other: &Self, budget: usize) -> Result<()> {
        if other.bits != self.bits {
            return Err(malformed("cannot append sequences of different symbol widths"));
        }
        let mut runs = self.runs();
        runs.extend(other.runs());
        self.rebuild(&normalize(runs), budget)
    }

    pub fn reindex(&mut self) -> Result<()> {
        *self = Self::encode(self.bits, &normalize(self.runs()))?;
        Ok(())
    }

    /// Checks that runs are normalized and that the index agrees with them; in particular the
    /// per-symbol totals must add up to the sequence length.
    pub fn validate(&self) -> Result<()> {
        let runs = self.runs();
        if let Some(pair) = runs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(malformed(format!("adjacent runs share symbol {}", pair[0].0)));
        }
        let alphabet = self.alphabet();
        if let Some(&(symbol, _)) = runs.iter().find(|(symbol, _)| usize::from(*symbol) >= alphabet) {
            return Err(TreeError::InvalidSymbol {
                symbol: u64::from(symbol),
                alphabet,
            });
        }
        let counted: usize = (0..alphabet)
            .map(|symbol| {
                #[allow(clippy::cast_possible_truncation)]
                self.count(symbol as u8)
            })
            .sum();
        if counted != self.len {
            return Err(malformed(format!("symbol counts add up to {counted}, sequence holds {}", self.len)));
        }
        let expected = Self::encode(self.bits, &runs)?;
        if expected.data != self.data {
            return Err(malformed("sequence index is out of date"));
        }
        Ok(())
    }
}

fn normalize(runs: impl IntoIterator<Item = Run>) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::new();
    for (symbol, len) in runs {
        if len == 0 {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.0 == symbol => last.1 += len,
            _ => out.push((symbol, len)),
        }
    }
    out
}

fn split_runs(runs: &[Run], at: usize) -> (Vec<Run>, Vec<Run>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut start = 0;
    for &(symbol, len) in runs {
        if start + len <= at {
            left.push((symbol, len));
        } else if start >= at {
            right.push((symbol, len));
        } else {
            left.push((symbol, at - start));
            right.push((symbol, start + len - at));
        }
        start += len;
    }
    (left, right)
}
