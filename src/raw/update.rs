//! Insert, split, remove and merge on top of a [`CowTxn`].
//!
//! Writes go through a [`Cursor`]: a path made mutable once and an offset inside its leaf. A
//! batch is pushed through the cursor one unit at a time; summaries above the leaf are only
//! refreshed when a node splits and once the batch is done.

use tracing::debug;

use super::cow::{CowTxn, TxnState};
use super::node::{BranchNode, Node};
use super::path::{Path, PathElement};
use crate::block::BlockId;
use crate::config::{MergePolicy, TreeConfig};
use crate::error::{Result, TreeError};
use crate::schema::Schema;
use crate::store::BlockStore;
use crate::walker::{walk, SeekShuttle};

/// One unit of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Unit<'e> {
    /// A whole entry, one value per stream.
    Entry(&'e [u64]),
    /// `len` copies of `symbol` in the run-length stream.
    Run { symbol: u8, len: usize },
}

impl Unit<'_> {
    /// Number of entries the unit adds.
    pub(crate) fn len(&self) -> usize {
        match self {
            Unit::Entry(_) => 1,
            Unit::Run { len, .. } => *len,
        }
    }
}

/// Insertion point inside a mutable path.
#[derive(Debug)]
pub(crate) struct Cursor {
    path: Path,
    offset: usize,
}

pub(crate) struct Updater<'a, S: BlockStore + ?Sized> {
    txn: CowTxn<'a, S>,
    config: &'a TreeConfig,
    block_size: usize,
}

impl<'a, S: BlockStore + ?Sized> Updater<'a, S> {
    pub(crate) fn begin(store: &'a S, schema: &'a Schema, name: &'a str, config: &'a TreeConfig) -> Result<Self> {
        Ok(Self {
            txn: CowTxn::begin(store, schema, name)?,
            config,
            block_size: store.block_size(),
        })
    }

    /// Returns the root as seen by the running transaction.
    pub(crate) fn root(&self) -> Option<BlockId> {
        self.txn.root()
    }

    pub(crate) fn commit(self) -> Result<Option<BlockId>> {
        self.txn.commit()
    }

    fn schema(&self) -> &'a Schema {
        self.txn.schema()
    }

    /// Clones every node of `path` the transaction does not own yet, top-down, re-pointing each
    /// parent at the clone of its child.
    fn make_path_mutable(&mut self, path: &mut Path) -> Result<()> {
        for idx in (0..path.height()).rev() {
            let element = path.element_mut(idx);
            let old = element.id;
            let new = self.txn.make_mutable(old, &mut element.node)?;
            if new == old {
                continue;
            }
            element.id = new;
            if idx + 1 == path.height() {
                self.txn.set_root(Some(new));
            } else {
                let parent = path.element_mut(idx + 1);
                let slot = parent.child_idx;
                parent.node.as_branch_mut().set_child(slot, new);
                self.txn.unref_child(old);
                self.txn.ref_child(new);
            }
        }
        Ok(())
    }

    /// Opens a cursor at `offset` of the leaf at the bottom of `path`; an empty tree gets a new leaf.
    pub(crate) fn cursor(&mut self, path: Option<Path>, offset: usize) -> Result<Cursor> {
        let path = match path {
            Some(mut path) => {
                self.make_path_mutable(&mut path)?;
                path
            }
            None => {
                let mut node = Node::new_leaf(self.schema(), self.txn.generation());
                let id = self.txn.allocate_node(&mut node)?;
                self.txn.set_root(Some(id));
                Path::single(id, node)
            }
        };
        Ok(Cursor { path, offset })
    }

    /// Inserts `units` at the cursor and leaves the cursor after the last one.
    ///
    /// `more` tells whether further units will follow this call.
    pub(crate) fn insert(&mut self, cursor: &mut Cursor, units: &[Unit<'_>], more: bool) -> Result<()> {
        for (idx, unit) in units.iter().enumerate() {
            self.insert_unit(cursor, *unit, more || idx + 1 < units.len())?;
        }
        Ok(())
    }

    fn insert_unit(&mut self, cursor: &mut Cursor, unit: Unit<'_>, more: bool) -> Result<()> {
        loop {
            let offset = cursor.offset;
            let leaf = cursor.path.leaf_mut();
            let result = match unit {
                Unit::Entry(entry) => leaf.try_insert(offset, entry, self.block_size),
                Unit::Run { symbol, len } => leaf.try_insert_run(offset, symbol, len, self.block_size),
            };
            let needed = match result {
                Ok(()) => {
                    cursor.offset += unit.len();
                    return Ok(());
                }
                Err(TreeError::OutOfSpace { needed, .. }) => needed,
                Err(err) => return Err(err),
            };

            let size = leaf.len();
            if size == 0 {
                return Err(TreeError::EntryTooLarge {
                    size: needed,
                    capacity: self.block_size,
                });
            }
            // Appending a batch leaves the full leaf intact and continues in an empty one.
            let at = if size == 1 {
                offset
            } else if more && offset == size {
                size
            } else {
                size / 2
            };
            let go_right = at > 0 && offset >= at;
            self.split(&mut cursor.path, 0, at, go_right)?;
            if go_right {
                cursor.offset -= at;
            }
        }
    }

    /// Splits the node at `idx` of `path` at `at`. The right part stays on the path when
    /// `go_right`, the left part otherwise; the part leaving the path is written out.
    fn split(&mut self, path: &mut Path, idx: usize, at: usize, go_right: bool) -> Result<()> {
        if idx + 1 == path.height() {
            self.grow_root(path)?;
        }
        let schema = self.schema();
        let (element, parent) = path.with_parent_mut(idx);
        let mut right = element.node.split_off(at)?;
        let right_id = self.txn.allocate_node(&mut right)?;

        let slot = parent.child_idx;
        let branch = parent.node.as_branch_mut();
        branch.set_child_summary(slot, &element.node.summary(schema))?;
        branch.insert_child(slot + 1, right_id, &right.summary(schema))?;
        self.txn.ref_child(right_id);
        debug!(
            level = element.node.level(),
            left = %element.id,
            right = %right_id,
            at,
            "split node"
        );

        if go_right {
            let left_id = core::mem::replace(&mut element.id, right_id);
            let left = core::mem::replace(&mut element.node, right);
            self.txn.write_node(left_id, &left)?;
            if !element.node.is_leaf() {
                element.child_idx -= at;
            }
            parent.child_idx += 1;
        } else {
            self.txn.write_node(right_id, &right)?;
        }

        if parent.node.encoded_len() > self.block_size {
            let parent_at = parent.node.len() / 2;
            let parent_right = parent.child_idx >= parent_at;
            self.split(path, idx + 1, parent_at, parent_right)?;
        }
        Ok(())
    }

    /// Puts a new root with the current root as its only child on top of `path`.
    fn grow_root(&mut self, path: &mut Path) -> Result<()> {
        let schema = self.schema();
        let top = path.root();
        let old = top.id;
        let level = top.node.level() + 1;
        let mut branch = BranchNode::new(schema, level, self.txn.generation());
        branch.insert_child(0, old, &top.node.summary(schema))?;
        let mut node = Node::Branch(branch);
        let id = self.txn.allocate_node(&mut node)?;
        self.txn.ref_child(old);
        self.txn.set_root(Some(id));
        debug!(root = %id, level, "grew root");
        path.push_root(PathElement { id, node, child_idx: 0 });
        Ok(())
    }

    /// Refreshes the summaries along `path` and writes every node on it.
    fn finish(&mut self, path: &mut Path) -> Result<()> {
        self.txn.set_state(TxnState::Propagating);
        let schema = self.schema();
        for idx in 1..path.height() {
            let (child, parent) = path.with_parent_mut(idx - 1);
            let summary = child.node.summary(schema);
            let slot = parent.child_idx;
            parent.node.as_branch_mut().set_child_summary(slot, &summary)?;
        }
        for element in path.elements() {
            self.txn.write_node(element.id, &element.node)?;
        }
        Ok(())
    }

    /// Completes the inserts made through `cursor`.
    pub(crate) fn close(&mut self, mut cursor: Cursor) -> Result<()> {
        self.finish(&mut cursor.path)
    }

    /// Removes up to `count` entries starting at position `from`; returns how many were removed.
    pub(crate) fn remove(&mut self, from: u64, count: u64) -> Result<u64> {
        let mut removed = 0u64;
        while removed < count {
            let descent = walk(self.txn.store(), self.schema(), self.txn.root(), SeekShuttle::new(from))?;
            let Some(mut path) = descent.path else { break };
            let offset = descent.output;
            let len = path.leaf().len();
            if offset >= len {
                break;
            }
            self.make_path_mutable(&mut path)?;
            let take = usize::try_from(count - removed).map_or(len - offset, |left| left.min(len - offset));
            path.leaf_mut().remove_space(offset, take)?;
            removed += take as u64;

            if path.leaf().is_empty() {
                self.remove_empty(&mut path)?;
            }
            if path.is_empty() {
                break;
            }
            if self.config.merge_policy == MergePolicy::Eager {
                self.merge_up(&mut path)?;
            }
            self.finish(&mut path)?;
            self.collapse_root(&mut path)?;
        }
        Ok(removed)
    }

    /// Unlinks the empty node at the bottom of `path` and every ancestor it leaves empty.
    fn remove_empty(&mut self, path: &mut Path) -> Result<()> {
        while !path.is_empty() && path.element(0).node.is_empty() {
            if path.height() > 1 {
                let (_, parent) = path.with_parent_mut(0);
                let slot = parent.child_idx;
                parent.node.as_branch_mut().remove_child(slot)?;
            } else {
                self.txn.set_root(None);
                debug!("tree is empty");
            }
            if let Some(element) = path.pop_bottom() {
                self.txn.discard(element.id, &element.node)?;
            }
        }
        Ok(())
    }

    /// Replaces a root branch with a single child by that child, repeatedly.
    fn collapse_root(&mut self, path: &mut Path) -> Result<()> {
        while path.height() > 1 && path.root().node.len() == 1 {
            let Some(top) = path.pop_root() else { break };
            let child = top.node.as_branch().child(0);
            self.txn.discard(top.id, &top.node)?;
            self.txn.set_root(Some(child));
            debug!(root = %child, "collapsed root");
        }
        Ok(())
    }

    /// Merges under-filled nodes on `path` into a sibling, bottom-up.
    fn merge_up(&mut self, path: &mut Path) -> Result<()> {
        let mut idx = 0;
        while idx + 1 < path.height() {
            let used = path.element(idx).node.encoded_len();
            if !self.config.is_underfilled(used, self.block_size) || !self.merge_sibling(path, idx)? {
                break;
            }
            idx += 1;
        }
        Ok(())
    }

    /// Merges the node at `idx` of `path` with its right (or else left) sibling if both fit in
    /// one block. The merged node stays on the path under the path node's block.
    fn merge_sibling(&mut self, path: &mut Path, idx: usize) -> Result<bool> {
        let parent = path.element(idx + 1);
        let slot = parent.child_idx;
        let sibling_slot = if slot + 1 < parent.node.len() {
            slot + 1
        } else if slot > 0 {
            slot - 1
        } else {
            return Ok(false);
        };
        let sibling_id = parent.node.as_branch().child(sibling_slot);
        let sibling = self.txn.load(sibling_id)?;

        let element = path.element(idx);
        let mut merged = if sibling_slot > slot {
            let mut merged = element.node.clone();
            merged.append_from(&sibling)?;
            merged
        } else {
            let mut merged = sibling.clone();
            merged.append_from(&element.node)?;
            merged
        };
        if merged.encoded_len() > self.block_size {
            return Ok(false);
        }
        merged.set_generation(self.txn.generation());

        // The merged node now holds the sibling's child references.
        if let Node::Branch(branch) = &sibling {
            for &child in branch.children() {
                self.txn.ref_child(child);
            }
        }
        if self.txn.owns(sibling_id) {
            self.txn.discard(sibling_id, &sibling)?;
        } else {
            self.txn.unref_child(sibling_id);
        }

        let (element, parent) = path.with_parent_mut(idx);
        debug!(level = merged.level(), node = %element.id, sibling = %sibling_id, "merged siblings");
        element.node = merged;
        parent.node.as_branch_mut().remove_child(sibling_slot)?;
        if sibling_slot < slot {
            if !element.node.is_leaf() {
                element.child_idx += sibling.len();
            }
            parent.child_idx -= 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::packed::IndexKind;
    use crate::raw::{check_tree, Severity};
    use crate::schema::{Column, ColumnKind, StreamKind};
    use crate::store::MemoryStore;
    use crate::walker::walk;

    fn store_with_root(block_size: usize) -> MemoryStore {
        let store = MemoryStore::with_block_size(block_size).unwrap();
        store.create_root("main").unwrap();
        store
    }

    fn append(store: &MemoryStore, schema: &Schema, config: &TreeConfig, values: &[u64]) {
        let mut updater = Updater::begin(store, schema, "main", config).unwrap();
        let descent = walk(store, schema, updater.root(), SeekShuttle::new(u64::MAX)).unwrap();
        let mut cursor = updater.cursor(descent.path, descent.output).unwrap();
        let entries: Vec<[u64; 1]> = values.iter().map(|&value| [value]).collect();
        let units: Vec<Unit<'_>> = entries.iter().map(|entry| Unit::Entry(entry)).collect();
        updater.insert(&mut cursor, &units, false).unwrap();
        updater.close(cursor).unwrap();
        updater.commit().unwrap();
    }

    fn contents(store: &MemoryStore, schema: &Schema) -> Vec<u64> {
        let mut out = Vec::new();
        let descent = walk(store, schema, store.root("main").unwrap(), SeekShuttle::new(0)).unwrap();
        if let Some(mut path) = descent.path {
            loop {
                out.extend(path.leaf().entries().iter().map(|entry| entry[0]));
                if !path.next_leaf(store, schema).unwrap() {
                    break;
                }
            }
        }
        out
    }

    fn assert_consistent(store: &MemoryStore, schema: &Schema, config: &TreeConfig) {
        let mut errors = Vec::new();
        let report = check_tree(store, schema, config, store.root("main").unwrap(), |severity, message| {
            if severity == Severity::Error {
                errors.push(message.to_string());
            }
        })
        .unwrap();
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn batch_append_splits_and_grows() {
        let schema = Schema::vector();
        let config = TreeConfig::default();
        let store = store_with_root(256);
        let values: Vec<u64> = (0..500).collect();
        append(&store, &schema, &config, &values);

        assert_eq!(contents(&store, &schema), values);
        assert_consistent(&store, &schema, &config);
        let root = store.root("main").unwrap().unwrap();
        assert!(store.get(root).unwrap().len() <= 256);
        assert_eq!(store.ref_count(root).unwrap(), 1);
    }

    #[test]
    fn remove_everything_empties_the_tree() {
        let schema = Schema::vector();
        let config = TreeConfig::default();
        let store = store_with_root(256);
        append(&store, &schema, &config, &(0..300).collect::<Vec<_>>());

        let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
        assert_eq!(updater.remove(0, 1000).unwrap(), 300);
        assert_eq!(updater.root(), None);
        updater.commit().unwrap();
        assert_eq!(store.root("main").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_middle_range_collapses() {
        let schema = Schema::vector();
        let config = TreeConfig::default();
        let store = store_with_root(256);
        append(&store, &schema, &config, &(0..300).collect::<Vec<_>>());

        let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
        assert_eq!(updater.remove(10, 285).unwrap(), 285);
        updater.commit().unwrap();

        let expected: Vec<u64> = (0..10).chain(295..300).collect();
        assert_eq!(contents(&store, &schema), expected);
        assert_consistent(&store, &schema, &config);
    }

    #[test]
    fn eager_merge_keeps_nodes_filled() {
        let schema = Schema::vector();
        let config = TreeConfig {
            merge_policy: MergePolicy::Eager,
            min_fill_percent: 50,
            ..TreeConfig::default()
        };
        let store = store_with_root(256);
        append(&store, &schema, &config, &(0..400).collect::<Vec<_>>());
        let before = store.len();

        for _ in 0..40 {
            let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
            updater.remove(3, 7).unwrap();
            updater.commit().unwrap();
        }
        assert!(store.len() < before);
        assert_eq!(contents(&store, &schema).len(), 400 - 280);
        assert_consistent(&store, &schema, &config);
    }

    #[test]
    fn aborted_batch_frees_its_blocks() {
        let schema = Schema::vle_vector();
        let config = TreeConfig::default();
        let store = store_with_root(256);
        let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
        let mut cursor = updater.cursor(None, 0).unwrap();
        // Wide enough values to need several leaves and a branch.
        let values: Vec<[u64; 1]> = (0..400).map(|value| [value * 1000]).collect();
        let units: Vec<Unit<'_>> = values.iter().map(|value| Unit::Entry(value)).collect();
        updater.insert(&mut cursor, &units, false).unwrap();
        assert!(store.len() > 3);
        drop(updater);
        assert!(store.is_empty());
        assert_eq!(store.root("main").unwrap(), None);
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let schema = Schema {
            id: 90,
            name: "wide".to_string(),
            streams: vec![
                StreamKind::Fixed {
                    width: 8,
                    index: IndexKind::Sum,
                };
                8
            ],
            columns: vec![Column::new(0, ColumnKind::Count)],
            key_column: None,
            sorted: false,
        };
        schema.validate().unwrap();
        let config = TreeConfig::default();
        let store = store_with_root(256);
        let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
        let mut cursor = updater.cursor(None, 0).unwrap();
        let err = updater.insert(&mut cursor, &[Unit::Entry(&[1; 8])], false).unwrap_err();
        assert!(matches!(err, TreeError::EntryTooLarge { capacity: 256, .. }));

        let narrow = Schema::symbol_sequence(91, "narrow", 1);
        let mut updater = Updater::begin(&store, &narrow, "main", &config).unwrap();
        let mut cursor = updater.cursor(None, 0).unwrap();
        let err = updater.insert(&mut cursor, &[Unit::Entry(&[7])], false).unwrap_err();
        assert!(matches!(err, TreeError::InvalidSymbol { symbol: 7, .. }));
    }

    #[test]
    fn runs_split_by_symbol_count() {
        let schema = Schema::sequence();
        let config = TreeConfig::default();
        let store = store_with_root(4096);
        let mut updater = Updater::begin(&store, &schema, "main", &config).unwrap();
        let mut cursor = updater.cursor(None, 0).unwrap();
        let units: Vec<Unit<'_>> = (0..3000)
            .map(|idx| Unit::Run {
                symbol: (idx % 4) as u8,
                len: 1 + idx % 5,
            })
            .collect();
        updater.insert(&mut cursor, &units, false).unwrap();
        updater.close(cursor).unwrap();
        updater.commit().unwrap();

        let total: usize = units.iter().map(Unit::len).sum();
        let root = store.root("main").unwrap().unwrap();
        let top = crate::raw::load(&store, &schema, root).unwrap();
        assert!(!top.is_leaf());
        assert_eq!(top.summary(&schema).count(), total as u64);
        assert_consistent(&store, &schema, &config);
    }
}
