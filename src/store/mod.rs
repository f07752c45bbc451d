//! Block store interface.
//!
//! The tree engine performs no I/O of its own. Every block it reads or writes goes through a
//! [`BlockStore`], which also owns block reference counts and the named snapshot roots.
//!
//! Reference counting contract:
//!
//! - Every child pointer inside a stored branch and every snapshot root label holds one
//!   reference to the block it names.
//! - A freshly allocated or cloned block starts with zero references and stays writable until
//!   it is sealed.
//! - Sealed blocks are immutable; [`BlockStore::write`] fails with
//!   [`TreeError::ImmutableBlock`](crate::TreeError::ImmutableBlock).

mod memory;

pub use memory::MemoryStore;

use bytes::Bytes;

use crate::block::{Block, BlockId};
use crate::error::Result;

pub trait BlockStore: Send + Sync {
    /// Capacity of every block in bytes.
    fn block_size(&self) -> usize;

    /// Allocates a new, empty, writable block able to hold `size` bytes.
    fn allocate(&self, size: usize) -> Result<BlockId>;

    fn get(&self, id: BlockId) -> Result<Block>;

    /// Replaces the contents of a writable block.
    fn write(&self, id: BlockId, data: Bytes) -> Result<()>;

    /// Copies a block into a new writable block and returns the new identifier.
    fn clone_for_write(&self, id: BlockId) -> Result<BlockId>;

    /// Makes a block immutable.
    fn seal(&self, id: BlockId) -> Result<()>;

    /// Adds one reference; returns the new count.
    fn ref_block(&self, id: BlockId) -> Result<u32>;

    /// Drops one reference; returns true when the count reached zero.
    ///
    /// The block is not freed: the caller still has to release the block's own references
    /// and then call [`free`](BlockStore::free).
    fn unref_block(&self, id: BlockId) -> Result<bool>;

    fn free(&self, id: BlockId) -> Result<()>;

    /// Registers a new, empty snapshot label.
    fn create_root(&self, name: &str) -> Result<()>;

    fn root(&self, name: &str) -> Result<Option<BlockId>>;

    /// Points a label at a new root and returns the previous one.
    ///
    /// Reference counts are not touched; the caller accounts for the label's reference.
    fn set_root(&self, name: &str, root: Option<BlockId>) -> Result<Option<BlockId>>;

    /// Removes a label and returns the root it pointed at.
    fn remove_root(&self, name: &str) -> Result<Option<BlockId>>;

    fn root_names(&self) -> Vec<String>;

    /// Returns a new transaction generation, strictly greater than all previous ones.
    fn next_generation(&self) -> u64;

    /// Lists every allocated block with its reference count.
    fn live_blocks(&self) -> Vec<(BlockId, u32)>;
}
