use super::{sum_child, sum_child_backward, Shuttle};
use crate::raw::{BranchNode, LeafNode};
use crate::schema::Schema;

/// Finds the leaf holding position `pos`, counting from the front.
///
/// Yields the leaf-local offset; positions past the end land on the end of the last leaf.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SeekShuttle {
    remaining: u64,
}

impl SeekShuttle {
    pub(crate) fn new(pos: u64) -> Self {
        Self { remaining: pos }
    }
}

impl Shuttle for SeekShuttle {
    type Output = usize;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, before) = sum_child(branch, 0, self.remaining, true);
        self.remaining -= before;
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, _schema: &Schema) -> usize {
        usize::try_from(self.remaining).map_or(leaf.len(), |offset| offset.min(leaf.len()))
    }

    fn empty(&mut self) -> usize {
        0
    }
}

/// Finds the entry `distance` places from the end (1 is the last entry).
///
/// Walks the mirrored comparison, folding right siblings; a distance larger than the tree lands
/// on the first entry.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SeekBackwardShuttle {
    remaining: u64,
}

impl SeekBackwardShuttle {
    pub(crate) fn new(distance: u64) -> Self {
        Self { remaining: distance }
    }
}

impl Shuttle for SeekBackwardShuttle {
    type Output = usize;

    fn branch(&mut self, branch: &BranchNode, _schema: &Schema) -> usize {
        let (idx, after) = sum_child_backward(branch, 0, self.remaining, false);
        self.remaining = self.remaining.saturating_sub(after);
        idx
    }

    fn leaf(&mut self, leaf: &LeafNode, _schema: &Schema) -> usize {
        let distance = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        leaf.len().saturating_sub(distance)
    }

    fn empty(&mut self) -> usize {
        0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::walker::tests::{entries, two_level};
    use crate::walker::walk;

    fn position(descent: &crate::walker::Descent<usize>) -> u64 {
        descent.leaf_start + descent.output as u64
    }

    #[test]
    fn forward_and_backward_agree() {
        let store = MemoryStore::default();
        let schema = Schema::vector();
        let root = two_level(&store, &schema, &[entries(&[0, 1, 2]), entries(&[3, 4]), entries(&[5, 6, 7, 8])]);
        let size = 9;
        for pos in 0..size {
            let forward = walk(&store, &schema, Some(root), SeekShuttle::new(pos)).unwrap();
            let backward = walk(&store, &schema, Some(root), SeekBackwardShuttle::new(size - pos)).unwrap();
            assert_eq!(position(&forward), pos);
            assert_eq!(position(&backward), pos);
            let leaf = forward.path.unwrap();
            assert_eq!(leaf.leaf().entry(forward.output).unwrap()[0], pos);
        }
    }

    #[test]
    fn out_of_range_clamps() {
        let store = MemoryStore::default();
        let schema = Schema::vector();
        let root = two_level(&store, &schema, &[entries(&[0, 1]), entries(&[2, 3])]);

        let end = walk(&store, &schema, Some(root), SeekShuttle::new(40)).unwrap();
        assert_eq!(position(&end), 4);
        assert_eq!(end.output, 2);

        let front = walk(&store, &schema, Some(root), SeekBackwardShuttle::new(40)).unwrap();
        assert_eq!(position(&front), 0);
    }
}
