//! Copy-on-write transactions.
//!
//! A [`CowTxn`] turns one logical mutation of a snapshot into a new tree. Nodes written by the
//! transaction carry its generation and are the only ones it may modify; every other node is
//! cloned into a fresh block before its first change. Reference count changes are queued while
//! the transaction runs and applied in one pass on commit, so an aborted transaction never
//! touches a block that an older root can still reach.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use super::node::{child_ids, Node};
use super::path::load;
use crate::block::BlockId;
use crate::error::Result;
use crate::schema::Schema;
use crate::store::BlockStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxnState {
    /// Resolving paths against the base root.
    Open,
    /// Leaf blocks are being cloned and changed.
    Mutating,
    /// Ancestors are being rewritten with new child references and summaries.
    Propagating,
    Committed,
    Aborted,
}

pub(crate) struct CowTxn<'a, S: BlockStore + ?Sized> {
    store: &'a S,
    schema: &'a Schema,
    name: &'a str,
    generation: u64,
    base_root: Option<BlockId>,
    root: Option<BlockId>,
    state: TxnState,
    allocated: BTreeSet<BlockId>,
    // Net reference count change per block.
    pending: BTreeMap<BlockId, i64>,
    // The root label already names the new root.
    published: bool,
}

impl<'a, S: BlockStore + ?Sized> CowTxn<'a, S> {
    /// Starts a transaction on the snapshot `name`.
    pub(crate) fn begin(store: &'a S, schema: &'a Schema, name: &'a str) -> Result<Self> {
        let base_root = store.root(name)?;
        let generation = store.next_generation();
        debug!(snapshot = name, generation, "began transaction");
        Ok(Self {
            store,
            schema,
            name,
            generation,
            base_root,
            root: base_root,
            state: TxnState::Open,
            allocated: BTreeSet::new(),
            pending: BTreeMap::new(),
            published: false,
        })
    }

    pub(crate) fn store(&self) -> &'a S {
        self.store
    }

    pub(crate) fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }

    /// Returns the root as seen by this transaction.
    pub(crate) fn root(&self) -> Option<BlockId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: Option<BlockId>) {
        self.root = root;
    }

    pub(crate) fn load(&self, id: BlockId) -> Result<Node> {
        load(self.store, self.schema, id)
    }

    /// Returns true if the block was allocated by this transaction and may be modified.
    pub(crate) fn owns(&self, id: BlockId) -> bool {
        self.allocated.contains(&id)
    }

    /// Queues one new reference to `id`.
    pub(crate) fn ref_child(&mut self, id: BlockId) {
        *self.pending.entry(id).or_default() += 1;
    }

    /// Queues the removal of one reference to `id`.
    pub(crate) fn unref_child(&mut self, id: BlockId) {
        *self.pending.entry(id).or_default() -= 1;
    }

    /// Allocates a block for a node created by this transaction.
    pub(crate) fn allocate_node(&mut self, node: &mut Node) -> Result<BlockId> {
        let id = self.store.allocate(self.store.block_size())?;
        self.allocated.insert(id);
        node.set_generation(self.generation);
        Ok(id)
    }

    /// Returns a block of this transaction holding `node`, cloning `id` if the transaction does
    /// not own it yet.
    ///
    /// A cloned branch holds a second reference to each of its children.
    pub(crate) fn make_mutable(&mut self, id: BlockId, node: &mut Node) -> Result<BlockId> {
        if node.generation() == self.generation {
            debug_assert!(self.owns(id), "`CowTxn::make_mutable()` - generation without ownership!");
            return Ok(id);
        }
        let clone = self.store.clone_for_write(id)?;
        self.allocated.insert(clone);
        node.set_generation(self.generation);
        if let Node::Branch(branch) = node {
            for &child in branch.children() {
                self.ref_child(child);
            }
        }
        if self.state == TxnState::Open {
            self.state = TxnState::Mutating;
        }
        Ok(clone)
    }

    /// Encodes `node` into a block owned by this transaction.
    pub(crate) fn write_node(&self, id: BlockId, node: &Node) -> Result<()> {
        assert!(self.owns(id), "`CowTxn::write_node()` - block is not owned by the transaction!");
        self.store.write(id, node.encode()?)
    }

    /// Frees a block of this transaction that no longer belongs to the tree.
    ///
    /// References held by a discarded branch are dropped.
    pub(crate) fn discard(&mut self, id: BlockId, node: &Node) -> Result<()> {
        assert!(self.owns(id), "`CowTxn::discard()` - block is not owned by the transaction!");
        self.store.free(id)?;
        self.allocated.remove(&id);
        self.pending.remove(&id);
        if let Node::Branch(branch) = node {
            for &child in branch.children() {
                self.unref_child(child);
            }
        }
        Ok(())
    }

    /// Applies the queued reference changes and publishes the new root.
    ///
    /// New references are taken and every block the transaction wrote is sealed before the root
    /// label moves, so a failure up to that point leaves the published tree untouched. Dropped
    /// references are applied last; blocks whose count reaches zero are released together with
    /// everything only they reach.
    pub(crate) fn commit(mut self) -> Result<Option<BlockId>> {
        self.state = TxnState::Propagating;
        if self.root != self.base_root {
            if let Some(root) = self.root {
                self.ref_child(root);
            }
            if let Some(base) = self.base_root {
                self.unref_child(base);
            }
        }

        let pending = core::mem::take(&mut self.pending);
        let mut taken = Vec::new();
        let outcome = self
            .acquire(&pending, &mut taken)
            .and_then(|()| self.store.set_root(self.name, self.root));
        if let Err(err) = outcome {
            for &id in &taken {
                if let Err(undo) = self.store.unref_block(id) {
                    warn!(block = %id, error = %undo, "failed to undo reference of aborted commit");
                }
            }
            return Err(err);
        }

        self.published = true;

        let mut released = 0usize;
        for (&id, &delta) in pending.iter().filter(|(_, delta)| **delta < 0) {
            for _ in 0..delta.unsigned_abs() {
                released += release(self.store, id)?;
            }
        }

        let allocated = core::mem::take(&mut self.allocated);
        self.state = TxnState::Committed;
        debug!(
            snapshot = self.name,
            generation = self.generation,
            root = ?self.root,
            written = allocated.len(),
            released,
            "committed transaction"
        );
        Ok(self.root)
    }

    /// Takes the positive reference changes and seals the written blocks, recording each
    /// reference taken in `taken`.
    fn acquire(&self, pending: &BTreeMap<BlockId, i64>, taken: &mut Vec<BlockId>) -> Result<()> {
        for (&id, &delta) in pending.iter().filter(|(_, delta)| **delta > 0) {
            for _ in 0..delta {
                self.store.ref_block(id)?;
                taken.push(id);
            }
        }
        for &id in &self.allocated {
            self.store.seal(id)?;
        }
        Ok(())
    }
}

impl<S: BlockStore + ?Sized> Drop for CowTxn<'_, S> {
    fn drop(&mut self) {
        if self.state == TxnState::Committed {
            return;
        }
        if self.published {
            warn!(
                snapshot = self.name,
                generation = self.generation,
                "transaction failed after publishing its root; keeping its blocks"
            );
            return;
        }
        self.state = TxnState::Aborted;
        for &id in &self.allocated {
            if let Err(err) = self.store.free(id) {
                warn!(block = %id, error = %err, "failed to free block of aborted transaction");
            }
        }
        debug!(
            snapshot = self.name,
            generation = self.generation,
            discarded = self.allocated.len(),
            "aborted transaction"
        );
    }
}

/// Drops one reference to `id`, freeing it and releasing its children once nothing refers to it.
///
/// Returns the number of blocks freed.
pub(crate) fn release<S: BlockStore + ?Sized>(store: &S, id: BlockId) -> Result<usize> {
    let mut freed = 0;
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
        if !store.unref_block(id)? {
            continue;
        }
        let block = store.get(id)?;
        stack.extend(child_ids(id, &block.data)?);
        store.free(id)?;
        freed += 1;
    }
    Ok(freed)
}
