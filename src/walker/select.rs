use super::{sum_child, sum_child_backward, Shuttle};
use crate::packed::Probe;
use crate::raw::{BranchNode, LeafNode};
use crate::schema::{ColumnKind, Schema};

/// Leaf-level answer of a select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Selected {
    /// Leaf-local offset of the selected entry, `None` if the column never reaches the target.
    pub(crate) offset: Option<usize>,
    /// Column aggregate up to and including the selected entry, or over everything visited on a
    /// miss.
    pub(crate) rank: u64,
}

/// Leaf-local select within `[0, len)` of the leaf, from the front or from the back.
fn select_in_leaf(leaf: &LeafNode, schema: &Schema, column: usize, target: u64, backward: bool) -> Selected {
    let column = schema.columns[column];
    let stream = leaf.stream(column.stream);
    let len = leaf.len();
    let whole = leaf.column_range(&column, 0, stream.len());
    let miss = Selected { offset: None, rank: whole };
    match column.kind {
        ColumnKind::Symbol(symbol) => {
            let Some(seq) = stream.as_rle() else { return miss };
            let Ok(k) = usize::try_from(target) else { return miss };
            let offset = if backward { seq.select_backward(k, symbol) } else { seq.select(k, symbol) };
            offset.map_or(miss, |offset| Selected {
                offset: Some(offset),
                rank: target,
            })
        }
        ColumnKind::Sum => {
            let probe = if backward {
                stream.find_sum_backward(target, false)
            } else {
                stream.find_sum(target, false)
            };
            match probe {
                Probe::Hit { idx, before } => Selected {
                    offset: Some(idx),
                    rank: before + stream.get(idx).unwrap_or(0),
                },
                Probe::Miss { .. } => miss,
            }
        }
        ColumnKind::Count => match usize::try_from(target) {
            Ok(k) if k >= 1 && k <= len => Selected {
                offset: Some(if backward { len - k } else { k - 1 }),
                rank: target,
            },
            _ => miss,
        },
        ColumnKind::Max => miss,
    }
}

/// Position at which the running aggregate of a SUM column first reaches a target.
///
/// With a symbol column this is the position of the k-th occurrence of the symbol; with a value
/// column it is a ranked find over prefix sums.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SelectShuttle {
    remaining: u64,
    column: usize,
    prefix: u64,
}

impl SelectShuttle {
    pub(crate) fn new(target: u64, column: usize) -> Self {
        Self {
            remaining: target,
            column,
            prefix: 0,
        }
    }
}

impl Shuttle for SelectShuttle {
    type Output = Selected;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, before) = sum_child(branch, self.column, self.remaining, false);
        self.remaining = self.remaining.saturating_sub(before);
        self.prefix += before;
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> Selected {
        let local = select_in_leaf(leaf, schema, self.column, self.remaining, false);
        Selected {
            offset: local.offset,
            rank: self.prefix + local.rank,
        }
    }

    fn empty(&mut self) -> Selected {
        Selected { offset: None, rank: 0 }
    }
}

/// Mirror of [`SelectShuttle`] counting from the end of the tree.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SelectBackwardShuttle {
    remaining: u64,
    column: usize,
    suffix: u64,
}

impl SelectBackwardShuttle {
    pub(crate) fn new(target: u64, column: usize) -> Self {
        Self {
            remaining: target,
            column,
            suffix: 0,
        }
    }
}

impl Shuttle for SelectBackwardShuttle {
    type Output = Selected;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, after) = sum_child_backward(branch, self.column, self.remaining, false);
        self.remaining = self.remaining.saturating_sub(after);
        self.suffix += after;
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> Selected {
        let local = select_in_leaf(leaf, schema, self.column, self.remaining, true);
        Selected {
            offset: local.offset,
            rank: self.suffix + local.rank,
        }
    }

    fn empty(&mut self) -> Selected {
        Selected { offset: None, rank: 0 }
    }
}
