//! Block-backed partitioned dataset (component C).
//!
//! A partition is identified by a [`BlockRef`] and, optionally, the
//! [`crate::wal::FileSegment`] that can rehydrate it if the in-memory
//! block store has evicted it. Reading a partition tries the block
//! store first and falls back to the WAL, repopulating the block store
//! on the way.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::wal::{FileSegment, WalRandomReader};

/// One opaque record as carried through the system. The core never
/// interprets record contents; only the query engine does.
pub type Record = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

/// Unique across a run: (stream-id, block-id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub stream_id: i64,
    pub block_id: BlockId,
}

/// Placement hint for [`BlockStore::put_iterator`]. The core never
/// inspects replication or physical placement beyond this tag, just
/// passes it through to whichever concrete block manager is plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePolicy {
    MemoryOnly,
    MemoryAndDisk,
    DiskOnly,
}

/// The four operations the core needs from a distributed block
/// manager. Concrete placement/replication is entirely the block
/// store's concern.
pub trait BlockStore: Send + Sync {
    fn get(&self, block_id: &BlockId) -> Option<Vec<Record>>;
    fn put_iterator(&self, block_id: BlockId, records: Vec<Record>, policy: StoragePolicy) -> Result<()>;
    fn get_matching_block_ids(&self, predicate: &dyn Fn(&BlockId) -> bool) -> HashSet<BlockId>;
}

/// A single-process, in-memory block store used by tests and by the
/// demo wiring in `main.rs`. A production deployment plugs in the
/// cluster's real block manager instead.
#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: DashMap<BlockId, Vec<Record>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get(&self, block_id: &BlockId) -> Option<Vec<Record>> {
        self.blocks.get(block_id).map(|entry| entry.clone())
    }

    fn put_iterator(&self, block_id: BlockId, records: Vec<Record>, _policy: StoragePolicy) -> Result<()> {
        self.blocks.insert(block_id, records);
        Ok(())
    }

    fn get_matching_block_ids(&self, predicate: &dyn Fn(&BlockId) -> bool) -> HashSet<BlockId> {
        self.blocks.iter().map(|e| e.key().clone()).filter(|id| predicate(id)).collect()
    }
}

/// One partition's addressing information: where to find it in the
/// block store, and where to rehydrate it from if it's gone.
#[derive(Debug, Clone)]
pub struct Partition {
    pub block_ref: BlockRef,
    pub wal_segment: Option<FileSegment>,
}

/// A partitioned collection whose partitions live in a block store and
/// spill to (or rehydrate from) the WAL on miss.
pub struct BlockBackedDataset {
    partitions: Vec<Partition>,
    block_store: Arc<dyn BlockStore>,
    storage_policy: StoragePolicy,
}

impl BlockBackedDataset {
    pub fn new(partitions: Vec<Partition>, block_store: Arc<dyn BlockStore>, storage_policy: StoragePolicy) -> Self {
        Self { partitions, block_store, storage_policy }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    /// Resolves one partition's records. Block-store hit returns
    /// immediately; a miss rehydrates from the WAL segment and
    /// repopulates the block store. Missing from both is fatal for
    /// that partition.
    pub fn compute(&self, partition_index: usize) -> Result<Vec<Record>> {
        let partition = self.partitions.get(partition_index).ok_or_else(|| {
            CoreError::BlockStore(format!("no such partition: {partition_index}"))
        })?;

        if let Some(records) = self.block_store.get(&partition.block_ref.block_id) {
            debug!(?partition.block_ref, "block store hit");
            return Ok(records);
        }

        let segment = partition.wal_segment.as_ref().ok_or_else(|| {
            CoreError::BlockStore(format!(
                "block {:?} is absent from the block store and has no WAL segment to rehydrate from",
                partition.block_ref
            ))
        })?;

        debug!(?partition.block_ref, path = %segment.path.display(), "rehydrating block from WAL");
        let mut reader = WalRandomReader::open(&segment.path)?;
        let payload = reader.read(segment)?;
        let (records, _): (Vec<Record>, usize) =
            bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;

        self.block_store.put_iterator(partition.block_ref.block_id.clone(), records.clone(), self.storage_policy)?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn block_ref(stream: i64, id: &str) -> BlockRef {
        BlockRef { stream_id: stream, block_id: BlockId(id.to_string()) }
    }

    #[test]
    fn reads_through_block_store_when_present() {
        let store = Arc::new(InMemoryBlockStore::new());
        store.put_iterator(BlockId("b1".into()), vec![b"a".to_vec()], StoragePolicy::MemoryOnly).unwrap();
        let ds = BlockBackedDataset::new(
            vec![Partition { block_ref: block_ref(1, "b1"), wal_segment: None }],
            store,
            StoragePolicy::MemoryOnly,
        );
        assert_eq!(ds.compute(0).unwrap(), vec![b"a".to_vec()]);
    }

    #[test]
    fn rehydrates_from_wal_on_block_store_miss() {
        let dir = tempfile::tempdir().unwrap();
        let wal = crate::wal::WalManager::new(dir.path(), 1 << 20, Duration::from_secs(3600)).unwrap();
        let records: Vec<Record> = vec![b"x".to_vec(), b"y".to_vec()];
        let payload = bincode::serde::encode_to_vec(&records, bincode::config::standard()).unwrap();
        let segment = wal.write(&payload).unwrap();
        wal.flush().unwrap();

        let store: Arc<dyn BlockStore> = Arc::new(InMemoryBlockStore::new());
        let ds = BlockBackedDataset::new(
            vec![Partition { block_ref: block_ref(1, "missing"), wal_segment: Some(segment) }],
            store.clone(),
            StoragePolicy::MemoryOnly,
        );

        assert_eq!(ds.compute(0).unwrap(), records);
        assert!(store.get(&BlockId("missing".into())).is_some(), "rehydration should repopulate the block store");
    }

    #[test]
    fn missing_from_both_is_fatal() {
        let store: Arc<dyn BlockStore> = Arc::new(InMemoryBlockStore::new());
        let ds = BlockBackedDataset::new(
            vec![Partition { block_ref: block_ref(1, "gone"), wal_segment: None }],
            store,
            StoragePolicy::MemoryOnly,
        );
        assert!(ds.compute(0).is_err());
    }
}
