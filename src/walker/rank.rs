use super::{sum_child, sum_child_backward, Shuttle};
use crate::raw::{BranchNode, LeafNode};
use crate::schema::Schema;

/// Aggregate of a SUM column over the entries `[0, pos)`.
///
/// For a symbol column this is the rank of the symbol before `pos`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RankShuttle {
    remaining: u64,
    column: usize,
    rank: u64,
}

impl RankShuttle {
    pub(crate) fn new(pos: u64, column: usize) -> Self {
        Self {
            remaining: pos,
            column,
            rank: 0,
        }
    }
}

impl Shuttle for RankShuttle {
    type Output = u64;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, before) = sum_child(branch, 0, self.remaining, true);
        self.remaining -= before;
        self.rank += branch.column(self.column).sum(0, idx);
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> u64 {
        let end = usize::try_from(self.remaining).map_or(leaf.len(), |offset| offset.min(leaf.len()));
        self.rank + leaf.column_range(&schema.columns[self.column], 0, end)
    }

    fn empty(&mut self) -> u64 {
        0
    }
}

/// Aggregate of a SUM column over the last `distance` entries.
///
/// Mirror of [`RankShuttle`]: right siblings are folded in instead of left ones.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RankBackwardShuttle {
    remaining: u64,
    column: usize,
    rank: u64,
}

impl RankBackwardShuttle {
    pub(crate) fn new(distance: u64, column: usize) -> Self {
        Self {
            remaining: distance,
            column,
            rank: 0,
        }
    }
}

impl Shuttle for RankBackwardShuttle {
    type Output = u64;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, after) = sum_child_backward(branch, 0, self.remaining, true);
        self.remaining = self.remaining.saturating_sub(after);
        let values = branch.column(self.column);
        self.rank += values.sum(idx + 1, values.len());
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> u64 {
        let distance = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let start = leaf.len().saturating_sub(distance);
        self.rank + leaf.column_range(&schema.columns[self.column], start, leaf.len())
    }

    fn empty(&mut self) -> u64 {
        0
    }
}
