use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::BlockStore;
use crate::block::{Block, BlockId};
use crate::config::StoreConfig;
use crate::error::{Result, TreeError};

#[derive(Debug)]
struct Slot {
    data: Bytes,
    refs: u32,
    sealed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<BlockId>,
    roots: BTreeMap<String, Option<BlockId>>,
    generation: u64,
}

impl Inner {
    fn len(&self) -> usize {
        self.slots.len().saturating_sub(self.free.len())
    }

    fn alloc(&mut self, slot: Slot, max_blocks: usize) -> Result<BlockId> {
        if let Some(id) = self.free.pop() {
            // Reuse a free slot.
            self.slots[id.to_index()] = Some(slot);
            return Ok(id);
        }
        if self.slots.len() >= max_blocks {
            return Err(TreeError::StoreFull(max_blocks));
        }
        self.slots.push(Some(slot));
        Ok(BlockId::from_index(self.slots.len() - 1))
    }

    fn slot(&self, id: BlockId) -> Result<&Slot> {
        self.slots
            .get(id.to_index())
            .and_then(Option::as_ref)
            .ok_or(TreeError::BlockNotFound(id))
    }

    fn slot_mut(&mut self, id: BlockId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.to_index())
            .and_then(Option::as_mut)
            .ok_or(TreeError::BlockNotFound(id))
    }
}

/// Block store keeping every block in memory.
///
/// Blocks live in a slot arena; freed slots are reused. All state sits behind one
/// `parking_lot::Mutex`, so the store can be shared between threads holding different
/// snapshots.
#[derive(Debug)]
pub struct MemoryStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn with_block_size(block_size: usize) -> Result<Self> {
        Self::new(StoreConfig {
            block_size,
            ..StoreConfig::default()
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of allocated blocks.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ref_count(&self, id: BlockId) -> Result<u32> {
        Ok(self.inner.lock().slot(id)?.refs)
    }

    pub fn is_sealed(&self, id: BlockId) -> Result<bool> {
        Ok(self.inner.lock().slot(id)?.sealed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            config: StoreConfig::default(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl BlockStore for MemoryStore {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn allocate(&self, size: usize) -> Result<BlockId> {
        if size > self.config.block_size {
            return Err(TreeError::OutOfSpace {
                needed: size,
                available: self.config.block_size,
            });
        }
        let slot = Slot {
            data: Bytes::new(),
            refs: 0,
            sealed: false,
        };
        let id = self.inner.lock().alloc(slot, self.config.max_blocks)?;
        trace!(block = %id, "allocated block");
        Ok(id)
    }

    fn get(&self, id: BlockId) -> Result<Block> {
        let inner = self.inner.lock();
        let slot = inner.slot(id)?;
        Ok(Block::new(id, slot.data.clone()))
    }

    fn write(&self, id: BlockId, data: Bytes) -> Result<()> {
        if data.len() > self.config.block_size {
            return Err(TreeError::OutOfSpace {
                needed: data.len(),
                available: self.config.block_size,
            });
        }
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(id)?;
        if slot.sealed {
            return Err(TreeError::ImmutableBlock(id));
        }
        slot.data = data;
        Ok(())
    }

    fn clone_for_write(&self, id: BlockId) -> Result<BlockId> {
        let mut inner = self.inner.lock();
        let data = inner.slot(id)?.data.clone();
        let slot = Slot {
            data,
            refs: 0,
            sealed: false,
        };
        let clone = inner.alloc(slot, self.config.max_blocks)?;
        trace!(block = %id, clone = %clone, "cloned block for write");
        Ok(clone)
    }

    fn seal(&self, id: BlockId) -> Result<()> {
        self.inner.lock().slot_mut(id)?.sealed = true;
        Ok(())
    }

    fn ref_block(&self, id: BlockId) -> Result<u32> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(id)?;
        slot.refs += 1;
        Ok(slot.refs)
    }

    fn unref_block(&self, id: BlockId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(id)?;
        if slot.refs == 0 {
            return Err(TreeError::Store(format!("block {id} has no references to drop")));
        }
        slot.refs -= 1;
        Ok(slot.refs == 0)
    }

    fn free(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.slots.get_mut(id.to_index()).ok_or(TreeError::BlockNotFound(id))?;
        if entry.take().is_none() {
            return Err(TreeError::BlockNotFound(id));
        }
        inner.free.push(id);
        trace!(block = %id, "freed block");
        Ok(())
    }

    fn create_root(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.roots.contains_key(name) {
            return Err(TreeError::SnapshotExists(name.to_string()));
        }
        inner.roots.insert(name.to_string(), None);
        Ok(())
    }

    fn root(&self, name: &str) -> Result<Option<BlockId>> {
        self.inner
            .lock()
            .roots
            .get(name)
            .copied()
            .ok_or_else(|| TreeError::SnapshotNotFound(name.to_string()))
    }

    fn set_root(&self, name: &str, root: Option<BlockId>) -> Result<Option<BlockId>> {
        let mut inner = self.inner.lock();
        let label = inner
            .roots
            .get_mut(name)
            .ok_or_else(|| TreeError::SnapshotNotFound(name.to_string()))?;
        Ok(core::mem::replace(label, root))
    }

    fn remove_root(&self, name: &str) -> Result<Option<BlockId>> {
        self.inner
            .lock()
            .roots
            .remove(name)
            .ok_or_else(|| TreeError::SnapshotNotFound(name.to_string()))
    }

    fn root_names(&self) -> Vec<String> {
        self.inner.lock().roots.keys().cloned().collect()
    }

    fn next_generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.generation
    }

    fn live_blocks(&self) -> Vec<(BlockId, u32)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (BlockId::from_index(index), slot.refs)))
            .collect()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> MemoryStore {
        MemoryStore::with_block_size(512).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(MemoryStore::with_block_size(16).is_err());
    }

    #[test]
    fn write_then_get() {
        let store = store();
        let id = store.allocate(512).unwrap();
        store.write(id, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(&store.get(id).unwrap().data[..], b"hello");
    }

    #[test]
    fn oversized_writes_fail() {
        let store = store();
        assert!(matches!(store.allocate(513), Err(TreeError::OutOfSpace { .. })));
        let id = store.allocate(64).unwrap();
        let err = store.write(id, Bytes::from(vec![0u8; 600])).unwrap_err();
        assert!(err.is_out_of_space());
    }

    #[test]
    fn sealed_blocks_are_immutable() {
        let store = store();
        let id = store.allocate(512).unwrap();
        store.write(id, Bytes::from_static(b"v1")).unwrap();
        store.seal(id).unwrap();
        assert!(matches!(store.write(id, Bytes::from_static(b"v2")), Err(TreeError::ImmutableBlock(_))));

        let clone = store.clone_for_write(id).unwrap();
        assert_ne!(clone, id);
        assert!(!store.is_sealed(clone).unwrap());
        assert_eq!(&store.get(clone).unwrap().data[..], b"v1");
        store.write(clone, Bytes::from_static(b"v2")).unwrap();
        assert_eq!(&store.get(id).unwrap().data[..], b"v1");
    }

    #[test]
    fn reference_counts() {
        let store = store();
        let id = store.allocate(512).unwrap();
        assert_eq!(store.ref_block(id).unwrap(), 1);
        assert_eq!(store.ref_block(id).unwrap(), 2);
        assert!(!store.unref_block(id).unwrap());
        assert!(store.unref_block(id).unwrap());
        assert!(store.unref_block(id).is_err());
        store.free(id).unwrap();
        assert!(matches!(store.get(id), Err(TreeError::BlockNotFound(_))));
        assert!(store.free(id).is_err());
    }

    #[test]
    fn freed_slots_are_reused() {
        let store = store();
        let a = store.allocate(512).unwrap();
        let _b = store.allocate(512).unwrap();
        store.free(a).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.allocate(512).unwrap(), a);
    }

    #[test]
    fn store_full() {
        let store = MemoryStore::new(StoreConfig { block_size: 512, max_blocks: 2 }).unwrap();
        store.allocate(512).unwrap();
        store.allocate(512).unwrap();
        assert!(matches!(store.allocate(512), Err(TreeError::StoreFull(2))));
    }

    #[test]
    fn named_roots() {
        let store = store();
        store.create_root("main").unwrap();
        assert!(matches!(store.create_root("main"), Err(TreeError::SnapshotExists(_))));
        assert_eq!(store.root("main").unwrap(), None);

        let id = store.allocate(512).unwrap();
        assert_eq!(store.set_root("main", Some(id)).unwrap(), None);
        assert_eq!(store.root("main").unwrap(), Some(id));
        assert_eq!(store.root_names(), vec!["main".to_string()]);
        assert_eq!(store.remove_root("main").unwrap(), Some(id));
        assert!(matches!(store.root("main"), Err(TreeError::SnapshotNotFound(_))));
        assert!(store.set_root("main", None).is_err());
    }

    #[test]
    fn generations_increase() {
        let store = store();
        let first = store.next_generation();
        assert!(store.next_generation() > first);
    }

    proptest! {
        #[test]
        fn live_blocks_track_allocations(operations in prop::collection::vec(any::<(bool, usize)>(), 0..128)) {
            let store = store();
            let mut model: Vec<BlockId> = Vec::new();

            for (alloc, which) in operations {
                if alloc || model.is_empty() {
                    model.push(store.allocate(512).unwrap());
                } else {
                    let id = model.swap_remove(which % model.len());
                    store.free(id).unwrap();
                }

                let mut live: Vec<BlockId> = store.live_blocks().into_iter().map(|(id, _)| id).collect();
                let mut expected = model.clone();
                live.sort();
                expected.sort();
                prop_assert_eq!(live, expected);
                prop_assert_eq!(store.len(), model.len());
            }
        }
    }
}
