use super::Shuttle;
use crate::raw::{BranchNode, LeafNode};
use crate::schema::Schema;

/// Finds the first entry whose key is `>= key`, or `> key` when `strict`.
///
/// Branches are searched through their MAX column of keys, so a child is entered only if it holds
/// a match. When nothing matches the walk ends on the last leaf with the offset one past its end.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FindShuttle {
    key: u64,
    strict: bool,
    column: usize,
}

impl FindShuttle {
    pub(crate) fn new(key: u64, strict: bool, column: usize) -> Self {
        Self { key, strict, column }
    }
}

impl Shuttle for FindShuttle {
    type Output = usize;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let keys = branch.column(self.column);
        let found = if self.strict { keys.find_gt(self.key) } else { keys.find_ge(self.key) };
        found.unwrap_or(branch.child_count() - 1)
    }

    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> usize {
        leaf.find_key(self.key, self.strict, schema)
    }

    fn empty(&mut self) -> usize {
        0
    }
}
