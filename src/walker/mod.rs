//! Generic root-to-leaf descent.
//!
//! Every positional query is a [`Shuttle`] driven by [`walk`]: at each branch the shuttle picks
//! the child to enter and folds the siblings it skips into its own running state; at the leaf it
//! produces the answer. The walker itself only tracks the count of entries to the left of the
//! leaf, so a leaf-local answer can be turned back into a tree position.

mod find;
mod rank;
mod select;
mod skip;

pub(crate) use find::FindShuttle;
pub(crate) use rank::{RankBackwardShuttle, RankShuttle};
pub(crate) use select::{SelectBackwardShuttle, SelectShuttle};
pub(crate) use skip::{SeekBackwardShuttle, SeekShuttle};

use smallvec::SmallVec;
use tracing::trace;

use crate::block::BlockId;
use crate::error::Result;
use crate::packed::Probe;
use crate::raw::{load, BranchNode, LeafNode, Path, PathElement};
use crate::schema::Schema;
use crate::store::BlockStore;

pub(crate) trait Shuttle {
    type Output;

    /// Picks the child of `branch` to descend into.
    fn branch(&mut self, branch: &BranchNode, schema: &Schema) -> usize;

    /// Produces the answer inside the leaf.
    fn leaf(&mut self, leaf: &LeafNode, schema: &Schema) -> Self::Output;

    /// Answer for an empty tree.
    fn empty(&mut self) -> Self::Output;
}

/// Result of one descent.
#[derive(Debug)]
pub(crate) struct Descent<T> {
    /// Nodes visited, `None` for an empty tree.
    pub(crate) path: Option<Path>,
    /// Entries to the left of the leaf.
    pub(crate) leaf_start: u64,
    pub(crate) output: T,
}

/// Descends from `root` to a leaf under the direction of `shuttle`.
pub(crate) fn walk<S, T>(store: &S, schema: &Schema, root: Option<BlockId>, mut shuttle: T) -> Result<Descent<T::Output>>
where
    S: BlockStore + ?Sized,
    T: Shuttle,
{
    let Some(mut id) = root else {
        return Ok(Descent {
            path: None,
            leaf_start: 0,
            output: shuttle.empty(),
        });
    };

    let mut elements: SmallVec<[PathElement; 8]> = SmallVec::new();
    let mut leaf_start = 0u64;
    let output = loop {
        let node = load(store, schema, id)?;
        if node.is_leaf() {
            let output = shuttle.leaf(node.as_leaf(), schema);
            elements.push(PathElement { id, node, child_idx: 0 });
            break output;
        }
        let branch = node.as_branch();
        let child_idx = shuttle.branch(branch, schema).min(branch.child_count() - 1);
        leaf_start += branch.column(0).sum(0, child_idx);
        let child = branch.child(child_idx);
        elements.push(PathElement { id, node, child_idx });
        id = child;
    };
    let path = Path::from_root_first(elements);
    trace!(
        shuttle = core::any::type_name::<T>(),
        height = path.height(),
        leaf = %path.leaf_id(),
        leaf_start,
        "walker descent"
    );
    Ok(Descent {
        path: Some(path),
        leaf_start,
        output,
    })
}

/// Child holding the running count `threshold` of a SUM column, searching from the left.
///
/// Returns the child and the aggregate of the children before it. A miss lands on the last child.
pub(crate) fn sum_child(branch: &BranchNode, column: usize, threshold: u64, strict: bool) -> (usize, u64) {
    match branch.column(column).find_sum(threshold, strict) {
        Probe::Hit { idx, before } => (idx, before),
        Probe::Miss { .. } => {
            let last = branch.child_count() - 1;
            (last, branch.column(column).sum(0, last))
        }
    }
}

/// Mirror of [`sum_child`] accumulating from the right. A miss lands on the first child.
pub(crate) fn sum_child_backward(branch: &BranchNode, column: usize, threshold: u64, strict: bool) -> (usize, u64) {
    let array = branch.column(column);
    match array.find_sum_backward(threshold, strict) {
        Probe::Hit { idx, before } => (idx, before),
        Probe::Miss { .. } => (0, array.sum(1, array.len())),
    }
}
