use super::Tree;
use crate::block::BlockId;
use crate::error::Result;
use crate::raw::Path;
use crate::schema::Entry;
use crate::store::{BlockStore, MemoryStore};

/// A position inside a tree together with the leaf holding it.
///
/// A chunk keeps the decoded path from the root to its leaf, so moving to a neighbouring leaf
/// with [`next_chunk`](Chunk::next_chunk) or [`prev_chunk`](Chunk::prev_chunk) only reloads the
/// nodes below the common ancestor. The chunk sees the tree as it was when the chunk was made.
#[derive(Debug)]
pub struct Chunk<'t, S: BlockStore + ?Sized = MemoryStore> {
    tree: &'t Tree<S>,
    path: Option<Path>,
    leaf_start: u64,
    local: usize,
    found: bool,
}

impl<'t, S: BlockStore + ?Sized> Chunk<'t, S> {
    /// Creates a chunk; an offset at the end of a leaf that has a successor moves to that
    /// successor.
    pub(crate) fn new(tree: &'t Tree<S>, path: Option<Path>, leaf_start: u64, local: usize, found: bool) -> Result<Self> {
        let mut chunk = Self {
            tree,
            path,
            leaf_start,
            local,
            found,
        };
        if chunk.path.as_ref().is_some_and(|path| chunk.local >= path.leaf().len()) {
            let local = chunk.local;
            if !chunk.next_chunk()? {
                chunk.local = local;
            }
            chunk.found = found && !chunk.is_end();
        }
        Ok(chunk)
    }

    /// Returns the position of the chunk in the tree.
    pub fn pos(&self) -> u64 {
        self.leaf_start + self.local as u64
    }

    /// Returns the offset of the chunk inside its leaf.
    pub fn local_index(&self) -> usize {
        self.local
    }

    /// Returns the position of the first entry of the leaf.
    pub fn leaf_start(&self) -> u64 {
        self.leaf_start
    }

    pub fn leaf_id(&self) -> Option<BlockId> {
        self.path.as_ref().map(Path::leaf_id)
    }

    /// Returns the number of entries in the leaf.
    pub fn leaf_size(&self) -> usize {
        self.path.as_ref().map_or(0, |path| path.leaf().len())
    }

    /// Returns true if the search that produced this chunk matched.
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Returns true if the chunk points one past the last entry.
    pub fn is_end(&self) -> bool {
        self.local >= self.leaf_size()
    }

    /// Returns the entry at leaf offset `idx`.
    pub fn entry(&self, idx: usize) -> Option<Entry> {
        self.path.as_ref()?.leaf().entry(idx)
    }

    /// Returns the entry the chunk points at.
    pub fn current(&self) -> Option<Entry> {
        self.entry(self.local)
    }

    /// Returns the key of the entry the chunk points at.
    pub fn key(&self) -> Option<u64> {
        self.path.as_ref()?.leaf().key(self.local, &self.tree.schema)
    }

    /// Returns every entry of the leaf.
    pub fn entries(&self) -> Vec<Entry> {
        self.path.as_ref().map(|path| path.leaf().entries()).unwrap_or_default()
    }

    /// Moves to the first entry of the next leaf.
    ///
    /// Returns false at the last leaf, leaving the chunk at the end of the tree.
    pub fn next_chunk(&mut self) -> Result<bool> {
        let tree = self.tree;
        let Some(path) = self.path.as_mut() else { return Ok(false) };
        let len = path.leaf().len();
        if path.next_leaf(&*tree.store, &tree.schema)? {
            self.leaf_start += len as u64;
            self.local = 0;
            self.found = true;
            Ok(true)
        } else {
            self.local = len;
            self.found = false;
            Ok(false)
        }
    }

    /// Moves to the first entry of the previous leaf.
    ///
    /// Returns false at the first leaf, leaving the chunk at position 0.
    pub fn prev_chunk(&mut self) -> Result<bool> {
        let tree = self.tree;
        let Some(path) = self.path.as_mut() else { return Ok(false) };
        let moved = path.prev_leaf(&*tree.store, &tree.schema)?;
        if moved {
            self.leaf_start -= path.leaf().len() as u64;
        }
        self.local = 0;
        self.found = !self.is_end();
        Ok(moved)
    }

    /// Moves one entry back; returns false (leaving the chunk unchanged) at position 0.
    pub(crate) fn step_back(&mut self) -> Result<bool> {
        if self.local > 0 {
            self.local -= 1;
            return Ok(true);
        }
        if self.prev_chunk()? {
            self.local = self.leaf_size() - 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn set_found(&mut self, found: bool) {
        self.found = found;
    }
}

/// Iterator over the entries of a tree from some position to the end.
#[derive(Debug)]
pub struct Entries<'t, S: BlockStore + ?Sized = MemoryStore> {
    chunk: Chunk<'t, S>,
    failed: bool,
}

impl<'t, S: BlockStore + ?Sized> Entries<'t, S> {
    pub(crate) fn new(chunk: Chunk<'t, S>) -> Self {
        Self { chunk, failed: false }
    }
}

impl<S: BlockStore + ?Sized> Iterator for Entries<'_, S> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.chunk.current() {
                self.chunk.local += 1;
                return Some(Ok(entry));
            }
            match self.chunk.next_chunk() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
