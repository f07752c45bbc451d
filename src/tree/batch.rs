//! Pull-style entry producers for batch inserts.

use core::iter::Peekable;

use crate::schema::Entry;

/// Source of entries for [`Tree::insert_from`](crate::Tree::insert_from).
///
/// The tree calls [`fill`](BatchProducer::fill) with an empty buffer until it returns false.
/// A call that adds no entries also ends the batch.
pub trait BatchProducer {
    /// Appends up to `limit` entries to `buffer`; returns true if more entries follow.
    fn fill(&mut self, buffer: &mut Vec<Entry>, limit: usize) -> bool;
}

/// Produces the entries of a slice.
#[derive(Clone, Debug)]
pub struct SliceProducer<'a> {
    entries: &'a [Entry],
    next: usize,
}

impl<'a> SliceProducer<'a> {
    pub fn new(entries: &'a [Entry]) -> Self {
        Self { entries, next: 0 }
    }
}

impl BatchProducer for SliceProducer<'_> {
    fn fill(&mut self, buffer: &mut Vec<Entry>, limit: usize) -> bool {
        let end = self.entries.len().min(self.next + limit);
        buffer.extend_from_slice(&self.entries[self.next..end]);
        self.next = end;
        self.next < self.entries.len()
    }
}

/// Produces the entries of an iterator.
#[derive(Debug)]
pub struct IterProducer<I: Iterator<Item = Entry>> {
    iter: Peekable<I>,
}

impl<I: Iterator<Item = Entry>> IterProducer<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter().peekable(),
        }
    }
}

impl<I: Iterator<Item = Entry>> BatchProducer for IterProducer<I> {
    fn fill(&mut self, buffer: &mut Vec<Entry>, limit: usize) -> bool {
        buffer.extend(self.iter.by_ref().take(limit));
        self.iter.peek().is_some()
    }
}

/// Expands `(symbol, length)` runs into single-symbol entries, `limit` at a time.
///
/// Trees with a run-length stream fold consecutive equal symbols back into runs, so long runs
/// cost one insert per fill cycle.
#[derive(Clone, Debug)]
pub struct RunProducer<'a> {
    runs: &'a [(u64, u64)],
    run: usize,
    used: u64,
}

impl<'a> RunProducer<'a> {
    pub fn new(runs: &'a [(u64, u64)]) -> Self {
        Self { runs, run: 0, used: 0 }
    }
}

impl BatchProducer for RunProducer<'_> {
    fn fill(&mut self, buffer: &mut Vec<Entry>, limit: usize) -> bool {
        let mut room = limit;
        while room > 0 {
            let Some(&(symbol, len)) = self.runs.get(self.run) else { break };
            let take = (len - self.used).min(room as u64);
            buffer.extend((0..take).map(|_| Entry::from_slice(&[symbol])));
            self.used += take;
            room -= take as usize;
            if self.used == len {
                self.run += 1;
                self.used = 0;
            }
        }
        self.runs[self.run..].iter().any(|&(_, len)| len > 0)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn drain(producer: &mut dyn BatchProducer, limit: usize) -> Vec<Vec<u64>> {
        let mut batches = Vec::new();
        loop {
            let mut buffer = Vec::new();
            let more = producer.fill(&mut buffer, limit);
            batches.push(buffer.iter().map(|entry| entry[0]).collect());
            if !more {
                return batches;
            }
        }
    }

    #[test]
    fn slice_producer_respects_limit() {
        let entries: Vec<Entry> = (0..5).map(|value| Entry::from_slice(&[value])).collect();
        let batches = drain(&mut SliceProducer::new(&entries), 2);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(drain(&mut SliceProducer::new(&[]), 2), vec![Vec::<u64>::new()]);
    }

    #[test]
    fn iter_producer_reports_the_end() {
        let mut producer = IterProducer::new((0..4).map(|value| Entry::from_slice(&[value])));
        assert_eq!(drain(&mut producer, 2), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn run_producer_expands_runs() {
        let runs = [(0, 3), (1, 0), (2, 2)];
        let batches = drain(&mut RunProducer::new(&runs), 4);
        assert_eq!(batches, vec![vec![0, 0, 0, 2], vec![2]]);
    }
}
