//! Containers bound to one snapshot of a block store.
//!
//! A [`Tree`] names a snapshot label, the schema its nodes follow and the store holding its
//! blocks. Reads walk from the current root of the label; writes run one copy-on-write
//! transaction each and publish the new root when they succeed. A failed write leaves the
//! label pointing at the previous root.

mod batch;
mod chunk;

pub use batch::{BatchProducer, IterProducer, RunProducer, SliceProducer};
pub use chunk::{Chunk, Entries};

use std::sync::Arc;

use tracing::{debug, info};

use crate::block::BlockId;
use crate::config::TreeConfig;
use crate::error::{Result, TreeError};
use crate::packed::SearchType;
use crate::raw::{
    check_tree, load, release, BranchNode, CheckReport, Cursor, NodeHeader, Severity, Summary, Unit, Updater,
};
use crate::schema::{Combinator, Entry, Schema, StreamKind};
use crate::store::{BlockStore, MemoryStore};
use crate::walker::{
    walk, FindShuttle, RankBackwardShuttle, RankShuttle, SeekBackwardShuttle, SeekShuttle, SelectBackwardShuttle,
    SelectShuttle,
};

/// Outcome of a skip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkipResult {
    /// Position reached.
    pub pos: u64,
    /// Number of entries actually passed over.
    pub skipped: u64,
}

/// Outcome of a select or a ranked find.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectResult {
    /// Selected position; the end of the tree (or 0 for backward selects) when not found.
    pub pos: u64,
    pub found: bool,
    /// Column aggregate up to and including `pos` when found, the whole aggregate otherwise.
    pub rank: u64,
}

impl SelectResult {
    fn miss(pos: u64, rank: u64) -> Self {
        Self { pos, found: false, rank }
    }
}

/// A container over one snapshot label.
#[derive(Debug)]
pub struct Tree<S: BlockStore + ?Sized = MemoryStore> {
    store: Arc<S>,
    schema: Arc<Schema>,
    config: TreeConfig,
    name: String,
}

impl Tree<MemoryStore> {
    /// Creates a tree labelled `main` in a new in-memory store with default settings.
    pub fn new(schema: impl Into<Arc<Schema>>) -> Result<Self> {
        Self::create(Arc::new(MemoryStore::default()), schema, "main", TreeConfig::default())
    }
}

impl<S: BlockStore + ?Sized> Tree<S> {
    /// Creates a new, empty snapshot label `name` in `store`.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::SnapshotExists`] if the label is taken, and with a configuration
    /// error if the schema is invalid or a branch of three children does not fit in a block.
    pub fn create(store: Arc<S>, schema: impl Into<Arc<Schema>>, name: &str, config: TreeConfig) -> Result<Self> {
        let schema = schema.into();
        schema.validate()?;
        config.validate()?;
        let block_size = store.block_size();
        let branch = BranchNode::encoded_len_for(&schema, 3);
        if branch > block_size {
            return Err(TreeError::Config(format!(
                "block size {block_size} cannot hold a branch of schema {} ({branch} bytes for three children)",
                schema.name
            )));
        }
        store.create_root(name)?;
        info!(snapshot = name, schema = %schema.name, block_size, "created tree");
        Ok(Self {
            store,
            schema,
            config,
            name: name.to_string(),
        })
    }

    /// Opens the existing snapshot label `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::SnapshotNotFound`] for an unknown label and with
    /// [`TreeError::SchemaMismatch`] if the root was written with another schema.
    pub fn open(store: Arc<S>, schema: impl Into<Arc<Schema>>, name: &str, config: TreeConfig) -> Result<Self> {
        let schema = schema.into();
        config.validate()?;
        if let Some(root) = store.root(name)? {
            let header = NodeHeader::parse(root, &store.get(root)?.data)?;
            if header.schema_id != schema.id {
                return Err(TreeError::SchemaMismatch {
                    expected: schema.id,
                    found: header.schema_id,
                });
            }
        }
        debug!(snapshot = name, schema = %schema.name, "opened tree");
        Ok(Self {
            store,
            schema,
            config,
            name: name.to_string(),
        })
    }

    /// Creates the snapshot label `name` sharing the current root of this tree.
    ///
    /// Both trees can be written independently afterwards; nodes are shared until one side
    /// changes them.
    pub fn branch(&self, name: &str) -> Result<Self> {
        self.store.create_root(name)?;
        let root = self.root()?;
        if let Some(root) = root {
            self.store.ref_block(root)?;
            self.store.set_root(name, Some(root))?;
        }
        info!(snapshot = %self.name, branch = name, root = ?root, "branched snapshot");
        Ok(Self {
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
            name: name.to_string(),
        })
    }

    /// Removes the snapshot label and releases every block only it reached; returns the number of
    /// blocks freed.
    pub fn drop_snapshot(self) -> Result<usize> {
        let freed = match self.store.remove_root(&self.name)? {
            Some(root) => release(&*self.store, root)?,
            None => 0,
        };
        info!(snapshot = %self.name, freed, "dropped snapshot");
        Ok(freed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the current root block.
    pub fn root(&self) -> Result<Option<BlockId>> {
        self.store.root(&self.name)
    }

    /// Returns the number of levels, 0 for an empty tree.
    pub fn height(&self) -> Result<usize> {
        let Some(root) = self.root()? else { return Ok(0) };
        let header = NodeHeader::parse(root, &self.store.get(root)?.data)?;
        Ok(usize::from(header.level) + 1)
    }

    /// Returns the aggregate of every column over the whole tree.
    pub fn summary(&self) -> Result<Summary> {
        match self.root()? {
            Some(root) => Ok(load(&*self.store, &self.schema, root)?.summary(&self.schema)),
            None => Ok(Summary::zero(self.schema.columns.len())),
        }
    }

    /// Returns the number of entries.
    pub fn size(&self) -> Result<u64> {
        Ok(self.summary()?.count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root()?.is_none())
    }

    // Reads

    /// Searches a sorted tree for `key`.
    ///
    /// `Ge`/`Gt` land on the first entry whose key is `>=`/`>` the key, `Le`/`Lt` on the last
    /// entry whose key is `<=`/`<` it and `Eq` on the first entry equal to it. Without a match
    /// the chunk is at the end of the tree and [`Chunk::is_found`] is false.
    pub fn find(&self, key: u64, search: SearchType) -> Result<Chunk<'_, S>> {
        let column = self.key_column("find")?;
        let strict = matches!(search, SearchType::Gt | SearchType::Le);
        let descent = walk(&*self.store, &self.schema, self.root()?, FindShuttle::new(key, strict, column))?;
        let mut chunk = Chunk::new(self, descent.path, descent.leaf_start, descent.output, true)?;
        match search {
            SearchType::Ge | SearchType::Gt => chunk.set_found(!chunk.is_end()),
            SearchType::Eq => {
                if chunk.key() != Some(key) {
                    return self.end_chunk();
                }
            }
            SearchType::Le | SearchType::Lt => {
                if !chunk.step_back()? {
                    return self.end_chunk();
                }
                chunk.set_found(true);
            }
        }
        Ok(chunk)
    }

    /// Returns a chunk at `pos`, clamped to the end of the tree.
    pub fn seek(&self, pos: u64) -> Result<Chunk<'_, S>> {
        let descent = walk(&*self.store, &self.schema, self.root()?, SeekShuttle::new(pos))?;
        let mut chunk = Chunk::new(self, descent.path, descent.leaf_start, descent.output, true)?;
        chunk.set_found(!chunk.is_end());
        Ok(chunk)
    }

    fn end_chunk(&self) -> Result<Chunk<'_, S>> {
        let mut chunk = self.seek(u64::MAX)?;
        chunk.set_found(false);
        Ok(chunk)
    }

    /// Returns the entry at `pos`.
    pub fn get(&self, pos: u64) -> Result<Option<Entry>> {
        Ok(self.seek(pos)?.current())
    }

    /// Moves `count` entries forward from `from`, stopping at the end of the tree.
    pub fn skip_forward(&self, from: u64, count: u64) -> Result<SkipResult> {
        let descent = walk(
            &*self.store,
            &self.schema,
            self.root()?,
            SeekShuttle::new(from.saturating_add(count)),
        )?;
        let pos = descent.leaf_start + descent.output as u64;
        Ok(SkipResult {
            pos,
            skipped: pos.saturating_sub(from),
        })
    }

    /// Moves `count` entries back from `from`, stopping at position 0.
    pub fn skip_backward(&self, from: u64, count: u64) -> Result<SkipResult> {
        let size = self.size()?;
        let from = from.min(size);
        let distance = (size - from).saturating_add(count);
        let descent = walk(&*self.store, &self.schema, self.root()?, SeekBackwardShuttle::new(distance))?;
        let pos = descent.leaf_start + descent.output as u64;
        Ok(SkipResult {
            pos,
            skipped: from - pos,
        })
    }

    /// Counts the occurrences of `symbol` in `[0, pos)`.
    pub fn rank(&self, pos: u64, symbol: u64) -> Result<u64> {
        let column = self.symbol_column(symbol, "rank")?;
        self.rank_column(pos, column)
    }

    /// Counts the occurrences of `symbol` in `[pos, size)`.
    pub fn rank_backward(&self, pos: u64, symbol: u64) -> Result<u64> {
        let column = self.symbol_column(symbol, "rank_backward")?;
        let size = self.size()?;
        let distance = size - pos.min(size);
        Ok(walk(&*self.store, &self.schema, self.root()?, RankBackwardShuttle::new(distance, column))?.output)
    }

    /// Returns the aggregate of the SUM column `column` over `[0, pos)`.
    pub fn rank_column(&self, pos: u64, column: usize) -> Result<u64> {
        self.sum_column(column, "rank_column")?;
        Ok(walk(&*self.store, &self.schema, self.root()?, RankShuttle::new(pos, column))?.output)
    }

    /// Finds the position of the `k`-th occurrence of `symbol`, counting from 1.
    ///
    /// `k == 0` selects nothing and yields position 0.
    pub fn select(&self, k: u64, symbol: u64) -> Result<SelectResult> {
        let column = self.symbol_column(symbol, "select")?;
        if k == 0 {
            return Ok(SelectResult::miss(0, 0));
        }
        self.select_column(column, k)
    }

    /// Finds the position of the `k`-th occurrence of `symbol`, counting from the end.
    pub fn select_backward(&self, k: u64, symbol: u64) -> Result<SelectResult> {
        let column = self.symbol_column(symbol, "select_backward")?;
        if k == 0 {
            return Ok(SelectResult::miss(0, 0));
        }
        let descent = walk(&*self.store, &self.schema, self.root()?, SelectBackwardShuttle::new(k, column))?;
        Ok(match descent.output.offset {
            Some(offset) => SelectResult {
                pos: descent.leaf_start + offset as u64,
                found: true,
                rank: descent.output.rank,
            },
            None => SelectResult::miss(0, descent.output.rank),
        })
    }

    /// Finds the first position at which the running aggregate of the SUM column `column`
    /// reaches `threshold`.
    pub fn find_sum(&self, column: usize, threshold: u64) -> Result<SelectResult> {
        self.sum_column(column, "find_sum")?;
        self.select_column(column, threshold)
    }

    fn select_column(&self, column: usize, target: u64) -> Result<SelectResult> {
        let descent = walk(&*self.store, &self.schema, self.root()?, SelectShuttle::new(target, column))?;
        Ok(match descent.output.offset {
            Some(offset) => SelectResult {
                pos: descent.leaf_start + offset as u64,
                found: true,
                rank: descent.output.rank,
            },
            None => SelectResult::miss(self.size()?, descent.output.rank),
        })
    }

    /// Returns an iterator over every entry.
    pub fn iter(&self) -> Result<Entries<'_, S>> {
        Ok(Entries::new(self.seek(0)?))
    }

    /// Checks the structure of the tree, reporting every finding to `consumer`.
    pub fn check(&self, consumer: impl FnMut(Severity, &str)) -> Result<CheckReport> {
        check_tree(&*self.store, &self.schema, &self.config, self.root()?, consumer)
    }

    // Writes

    /// Inserts `entries` before position `pos` (clamped to the end) and returns a chunk just
    /// after them.
    ///
    /// Sorted trees only accept entries that keep the keys in order.
    pub fn insert(&mut self, pos: u64, entries: &[Entry]) -> Result<Chunk<'_, S>> {
        let (start, inserted) = self.insert_batch(pos, &mut SliceProducer::new(entries))?;
        self.seek(start + inserted)
    }

    /// Inserts everything `producer` yields before position `pos`; returns the number of entries
    /// inserted.
    ///
    /// The batch is one transaction: if the producer yields an invalid entry nothing is inserted.
    pub fn insert_from(&mut self, pos: u64, producer: &mut dyn BatchProducer) -> Result<u64> {
        Ok(self.insert_batch(pos, producer)?.1)
    }

    /// Appends `entries` at the end of the tree.
    pub fn append(&mut self, entries: &[Entry]) -> Result<Chunk<'_, S>> {
        self.insert(u64::MAX, entries)
    }

    /// Inserts `entry` into a sorted tree at the position of its key.
    ///
    /// Returns false, inserting nothing, if an entry with the same key is present.
    pub fn insert_sorted(&mut self, entry: &[u64]) -> Result<bool> {
        let column = self.key_column("insert_sorted")?;
        self.check_arity(entry)?;
        let key = entry[self.schema.columns[column].stream];
        let (pos, present) = {
            let chunk = self.find(key, SearchType::Ge)?;
            (chunk.pos(), chunk.key() == Some(key))
        };
        if present {
            return Ok(false);
        }
        self.insert_batch(pos, &mut SliceProducer::new(&[Entry::from_slice(entry)]))?;
        Ok(true)
    }

    /// Inserts `len` copies of `symbol` before position `pos` of a symbol sequence.
    pub fn insert_run(&mut self, pos: u64, symbol: u64, len: usize) -> Result<Chunk<'_, S>> {
        let symbol = self.check_symbol(symbol, "insert_run")?;
        if len == 0 {
            return self.seek(pos);
        }
        let (start, ()) = self.update_at(pos, |updater, cursor| {
            updater.insert(cursor, &[Unit::Run { symbol, len }], false)
        })?;
        debug!(snapshot = %self.name, symbol, len, "inserted run");
        self.seek(start + len as u64)
    }

    /// Removes the entries in `[from, to)`; returns how many were removed.
    pub fn remove(&mut self, from: u64, to: u64) -> Result<u64> {
        if to <= from {
            return Ok(0);
        }
        let mut updater = Updater::begin(&*self.store, &self.schema, &self.name, &self.config)?;
        let removed = updater.remove(from, to - from)?;
        if removed > 0 {
            updater.commit()?;
        }
        debug!(snapshot = %self.name, from, removed, "removed entries");
        Ok(removed)
    }

    /// Runs one write transaction with a cursor at `pos`; returns the clamped start position and
    /// the result of `body`.
    fn update_at<T>(
        &self,
        pos: u64,
        body: impl FnOnce(&mut Updater<'_, S>, &mut Cursor) -> Result<T>,
    ) -> Result<(u64, T)> {
        let mut updater = Updater::begin(&*self.store, &self.schema, &self.name, &self.config)?;
        let descent = walk(&*self.store, &self.schema, updater.root(), SeekShuttle::new(pos))?;
        let start = descent.leaf_start + descent.output as u64;
        let mut cursor = updater.cursor(descent.path, descent.output)?;
        let value = body(&mut updater, &mut cursor)?;
        updater.close(cursor)?;
        updater.commit()?;
        Ok((start, value))
    }

    fn insert_batch(&self, pos: u64, producer: &mut dyn BatchProducer) -> Result<(u64, u64)> {
        let mut buffer = Vec::with_capacity(self.config.batch_size);
        let mut more = producer.fill(&mut buffer, self.config.batch_size);
        if buffer.is_empty() {
            let size = self.size()?;
            return Ok((pos.min(size), 0));
        }
        let mut order = self.key_order(pos)?;
        let (start, inserted) = self.update_at(pos, |updater, cursor| {
            let mut inserted = 0u64;
            loop {
                for entry in &buffer {
                    self.check_arity(entry)?;
                    if let Some(order) = order.as_mut() {
                        order.accept(entry, &self.schema)?;
                    }
                }
                let units = self.units(&buffer)?;
                updater.insert(cursor, &units, more)?;
                inserted += buffer.len() as u64;
                if !more {
                    return Ok(inserted);
                }
                buffer.clear();
                more = producer.fill(&mut buffer, self.config.batch_size);
                if buffer.is_empty() {
                    return Ok(inserted);
                }
            }
        })?;
        debug!(snapshot = %self.name, pos = start, inserted, "inserted batch");
        Ok((start, inserted))
    }

    /// Groups a buffer into insertion units, folding equal neighbours into runs when the tree is a
    /// symbol sequence.
    fn units<'e>(&self, entries: &'e [Entry]) -> Result<Vec<Unit<'e>>> {
        if self.schema.run_stream().is_none() {
            return Ok(entries.iter().map(|entry| Unit::Entry(entry.as_slice())).collect());
        }
        let mut units: Vec<Unit<'e>> = Vec::new();
        for entry in entries {
            let symbol = self.check_symbol(entry[0], "insert")?;
            match units.last_mut() {
                Some(Unit::Run { symbol: last, len }) if *last == symbol => *len += 1,
                _ => units.push(Unit::Run { symbol, len: 1 }),
            }
        }
        Ok(units)
    }

    /// Key bounds an insert at `pos` must respect, `None` for unsorted trees.
    fn key_order(&self, pos: u64) -> Result<Option<KeyOrder>> {
        if !self.schema.sorted {
            return Ok(None);
        }
        let chunk = self.seek(pos)?;
        let upper = chunk.key();
        let last = match chunk.pos() {
            0 => None,
            pos => self.seek(pos - 1)?.key(),
        };
        Ok(Some(KeyOrder { last, upper }))
    }

    fn check_arity(&self, entry: &[u64]) -> Result<()> {
        if entry.len() == self.schema.arity() {
            Ok(())
        } else {
            Err(TreeError::EntryArity {
                expected: self.schema.arity(),
                actual: entry.len(),
            })
        }
    }

    fn unsupported(&self, operation: &'static str) -> TreeError {
        TreeError::Unsupported {
            schema: self.schema.name.clone(),
            operation,
        }
    }

    fn key_column(&self, operation: &'static str) -> Result<usize> {
        self.schema.key_column.ok_or_else(|| self.unsupported(operation))
    }

    fn sum_column(&self, column: usize, operation: &'static str) -> Result<()> {
        match self.schema.columns.get(column) {
            Some(found) if found.kind.combinator() == Combinator::Sum => Ok(()),
            _ => Err(self.unsupported(operation)),
        }
    }

    fn symbol_column(&self, symbol: u64, operation: &'static str) -> Result<usize> {
        let symbol = self.check_symbol(symbol, operation)?;
        self.schema.symbol_column(symbol).ok_or_else(|| self.unsupported(operation))
    }

    /// Validates `value` against the alphabet of the run-length stream.
    fn check_symbol(&self, value: u64, operation: &'static str) -> Result<u8> {
        let Some(stream) = self.schema.run_stream() else {
            return Err(self.unsupported(operation));
        };
        let StreamKind::Rle { bits } = self.schema.streams[stream] else {
            return Err(self.unsupported(operation));
        };
        let alphabet = 1usize << bits;
        u8::try_from(value)
            .ok()
            .filter(|&symbol| usize::from(symbol) < alphabet)
            .ok_or(TreeError::InvalidSymbol {
                symbol: value,
                alphabet,
            })
    }
}

/// Running key check of an insert into a sorted tree.
struct KeyOrder {
    last: Option<u64>,
    upper: Option<u64>,
}

impl KeyOrder {
    fn accept(&mut self, entry: &[u64], schema: &Schema) -> Result<()> {
        let Some(stream) = schema.key_stream() else { return Ok(()) };
        let key = entry[stream];
        if self.last.is_some_and(|last| key < last) || self.upper.is_some_and(|upper| key > upper) {
            return Err(TreeError::Unsupported {
                schema: schema.name.clone(),
                operation: "unordered insert",
            });
        }
        self.last = Some(key);
        Ok(())
    }
}
