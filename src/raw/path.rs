use smallvec::SmallVec;

use super::node::{LeafNode, Node};
use crate::block::BlockId;
use crate::error::Result;
use crate::schema::Schema;
use crate::store::BlockStore;

/// Reads and decodes one node.
pub(crate) fn load<S: BlockStore + ?Sized>(store: &S, schema: &Schema, id: BlockId) -> Result<Node> {
    let block = store.get(id)?;
    Node::decode(id, &block.data, schema)
}

/// One node on a [`Path`].
#[derive(Clone, Debug)]
pub(crate) struct PathElement {
    pub(crate) id: BlockId,
    pub(crate) node: Node,
    /// Child descended into; unused for the leaf.
    pub(crate) child_idx: usize,
}

/// Nodes from one leaf up to the root, decoded once per operation.
///
/// Element 0 is the leaf and the last element is the root, so on a complete path the index of
/// an element equals the level of its node.
#[derive(Clone, Debug, Default)]
pub(crate) struct Path {
    levels: SmallVec<[PathElement; 8]>,
}

impl Path {
    /// Builds a path from elements listed root first.
    pub(crate) fn from_root_first(mut elements: SmallVec<[PathElement; 8]>) -> Self {
        elements.reverse();
        Self { levels: elements }
    }

    /// Creates a path holding a single root leaf.
    pub(crate) fn single(id: BlockId, node: Node) -> Self {
        let mut levels = SmallVec::new();
        levels.push(PathElement { id, node, child_idx: 0 });
        Self { levels }
    }

    /// Returns the number of nodes on the path.
    pub(crate) fn height(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Returns the element at `idx` (0 is the bottom of the path).
    pub(crate) fn element(&self, idx: usize) -> &PathElement {
        &self.levels[idx]
    }

    pub(crate) fn element_mut(&mut self, idx: usize) -> &mut PathElement {
        &mut self.levels[idx]
    }

    /// Returns the element at `idx` together with its parent.
    pub(crate) fn with_parent_mut(&mut self, idx: usize) -> (&mut PathElement, &mut PathElement) {
        let (lower, upper) = self.levels.split_at_mut(idx + 1);
        (&mut lower[idx], &mut upper[0])
    }

    pub(crate) fn elements(&self) -> &[PathElement] {
        &self.levels
    }

    /// Returns the root element.
    pub(crate) fn root(&self) -> &PathElement {
        self.levels.last().expect("`Path::root()` - path is empty!")
    }

    /// Adds a new root above the current one.
    pub(crate) fn push_root(&mut self, element: PathElement) {
        self.levels.push(element);
    }

    /// Removes the root element.
    pub(crate) fn pop_root(&mut self) -> Option<PathElement> {
        self.levels.pop()
    }

    /// Removes the bottom element.
    pub(crate) fn pop_bottom(&mut self) -> Option<PathElement> {
        if self.levels.is_empty() {
            None
        } else {
            Some(self.levels.remove(0))
        }
    }

    pub(crate) fn leaf_id(&self) -> BlockId {
        self.levels[0].id
    }

    /// Returns the leaf node at the bottom of the path.
    pub(crate) fn leaf(&self) -> &LeafNode {
        self.levels[0].node.as_leaf()
    }

    pub(crate) fn leaf_mut(&mut self) -> &mut LeafNode {
        self.levels[0].node.as_leaf_mut()
    }

    /// Moves the path to the next leaf; returns false (leaving the path unchanged) at the last leaf.
    pub(crate) fn next_leaf<S: BlockStore + ?Sized>(&mut self, store: &S, schema: &Schema) -> Result<bool> {
        let Some(level) = (1..self.levels.len()).find(|&level| {
            let element = &self.levels[level];
            element.child_idx + 1 < element.node.as_branch().child_count()
        }) else {
            return Ok(false);
        };
        self.levels[level].child_idx += 1;
        self.descend_from(store, schema, level, |_| 0)?;
        Ok(true)
    }

    /// Moves the path to the previous leaf; returns false (leaving the path unchanged) at the first leaf.
    pub(crate) fn prev_leaf<S: BlockStore + ?Sized>(&mut self, store: &S, schema: &Schema) -> Result<bool> {
        let Some(level) = (1..self.levels.len()).find(|&level| self.levels[level].child_idx > 0) else {
            return Ok(false);
        };
        self.levels[level].child_idx -= 1;
        self.descend_from(store, schema, level, |node| node.len().saturating_sub(1))?;
        Ok(true)
    }

    /// Reloads every level below `level`, picking the child of each branch with `pick`.
    fn descend_from<S: BlockStore + ?Sized>(
        &mut self,
        store: &S,
        schema: &Schema,
        level: usize,
        pick: impl Fn(&Node) -> usize,
    ) -> Result<()> {
        for below in (0..level).rev() {
            let parent = &self.levels[below + 1];
            let id = parent.node.as_branch().child(parent.child_idx);
            let node = load(store, schema, id)?;
            let child_idx = if node.is_leaf() { 0 } else { pick(&node) };
            self.levels[below] = PathElement { id, node, child_idx };
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::raw::node::BranchNode;
    use crate::raw::Summary;
    use crate::store::MemoryStore;

    // Two-level tree over an ordered set: leaves hold [0, 1], [2, 3] and [4].
    fn build(store: &MemoryStore, schema: &Schema) -> Path {
        let mut branch = BranchNode::new(schema, 1, 1);
        for (idx, keys) in [&[0u64, 1][..], &[2, 3], &[4]].into_iter().enumerate() {
            let mut leaf = LeafNode::new(schema, 1);
            for (at, &key) in keys.iter().enumerate() {
                leaf.try_insert(at, &[key], usize::MAX).unwrap();
            }
            let summary = leaf.summary(schema);
            let id = store.allocate(store.block_size()).unwrap();
            store.write(id, Node::Leaf(leaf).encode().unwrap()).unwrap();
            branch.insert_child(idx, id, &summary).unwrap();
        }
        let root = store.allocate(store.block_size()).unwrap();
        let first = branch.child(0);
        store.write(root, Node::Branch(branch.clone()).encode().unwrap()).unwrap();

        let mut elements = SmallVec::new();
        elements.push(PathElement { id: root, node: Node::Branch(branch), child_idx: 0 });
        elements.push(PathElement { id: first, node: load(store, schema, first).unwrap(), child_idx: 0 });
        Path::from_root_first(elements)
    }

    #[test]
    fn walks_leaves_in_both_directions() {
        let store = MemoryStore::default();
        let schema = Schema::ordered_set();
        let mut path = build(&store, &schema);
        assert_eq!(path.height(), 2);
        assert_eq!(path.root().node.level(), 1);

        let mut keys = vec![path.leaf().entries()];
        while path.next_leaf(&store, &schema).unwrap() {
            keys.push(path.leaf().entries());
        }
        let flat: Vec<u64> = keys.iter().flatten().map(|entry| entry[0]).collect();
        assert_eq!(flat, vec![0, 1, 2, 3, 4]);
        assert_eq!(path.element(1).child_idx, 2);

        assert!(path.prev_leaf(&store, &schema).unwrap());
        assert_eq!(path.leaf().key(0, &schema), Some(2));
        assert!(path.prev_leaf(&store, &schema).unwrap());
        assert!(!path.prev_leaf(&store, &schema).unwrap());
        assert_eq!(path.leaf().key(0, &schema), Some(0));
    }

    #[test]
    fn parent_access() {
        let store = MemoryStore::default();
        let schema = Schema::ordered_set();
        let mut path = build(&store, &schema);
        let (leaf, parent) = path.with_parent_mut(0);
        assert!(leaf.node.is_leaf());
        assert_eq!(parent.node.as_branch().child_summary(0), Summary::from_values([2, 1]));

        assert!(path.pop_bottom().unwrap().node.is_leaf());
        assert_eq!(path.height(), 1);
        assert!(path.pop_root().is_some());
        assert!(path.is_empty());
    }
}
