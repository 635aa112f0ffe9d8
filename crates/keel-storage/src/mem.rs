use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;

use keel_types::KeelError;

use crate::traits::{LogStorage, StorageEngine};
use crate::types::{LogRecord, Partition, Vote, WriteOp};

// ---------------------------------------------------------------------------
// MemEngine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemPartitions {
    documents: BTreeMap<Vec<u8>, Vec<u8>>,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemPartitions {
    fn partition(&self, partition: Partition) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        match partition {
            Partition::Documents => &self.documents,
            Partition::Meta => &self.meta,
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        match partition {
            Partition::Documents => &mut self.documents,
            Partition::Meta => &mut self.meta,
        }
    }
}

/// In-memory document engine backed by `BTreeMap`s.
///
/// Not persisted across restarts. Iteration order is key order, same as the
/// fjall engine.
#[derive(Default)]
pub struct MemEngine {
    inner: SyncRwLock<MemPartitions>,
    closed: AtomicBool,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), KeelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeelError::Unavailable("store closed".into()));
        }
        Ok(())
    }
}

impl StorageEngine for MemEngine {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, KeelError> {
        self.ensure_open()?;
        Ok(self.inner.read().partition(partition).get(key).cloned())
    }

    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KeelError> {
        self.ensure_open()?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let g = self.inner.read();
        Ok(g.partition(partition)
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .skip(offset)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, partition: Partition, prefix: &[u8]) -> Result<usize, KeelError> {
        self.ensure_open()?;
        let g = self.inner.read();
        Ok(g.partition(partition)
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), KeelError> {
        self.ensure_open()?;
        let mut g = self.inner.write();
        for op in ops {
            match op {
                WriteOp::Put { partition, key, value } => {
                    g.partition_mut(partition).insert(key, value);
                }
                WriteOp::Delete { partition, key } => {
                    g.partition_mut(partition).remove(&key);
                }
            }
        }
        Ok(())
    }

    fn health(&self) -> Result<(), KeelError> {
        self.ensure_open()
    }

    fn close(&self) -> Result<(), KeelError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemLogInner {
    entries: BTreeMap<u64, Vec<u8>>, // index → payload
    last_purged: Option<Vec<u8>>,
    vote: Option<Vote>,
    committed: Option<Vec<u8>>,
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Intended for tests and single-process clusters; not persisted across
/// restarts.
#[derive(Default)]
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemLogStorage {
    async fn last_entry(&self) -> Result<Option<LogRecord>, KeelError> {
        let g = self.inner.read().await;
        Ok(g.entries
            .iter()
            .next_back()
            .map(|(&index, payload)| LogRecord { index, payload: payload.clone() }))
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogRecord>, KeelError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries
            .range(from..=to_inclusive)
            .map(|(&index, payload)| LogRecord { index, payload: payload.clone() })
            .collect())
    }

    async fn append(&self, entries: Vec<LogRecord>) -> Result<(), KeelError> {
        let mut g = self.inner.write().await;
        for entry in entries {
            g.entries.insert(entry.index, entry.payload);
        }
        Ok(())
    }

    async fn truncate(&self, from_index: u64) -> Result<(), KeelError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx < from_index);
        Ok(())
    }

    async fn purge(&self, up_to_index: u64, marker: Vec<u8>) -> Result<(), KeelError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > up_to_index);
        g.last_purged = Some(marker);
        Ok(())
    }

    async fn last_purged(&self) -> Result<Option<Vec<u8>>, KeelError> {
        Ok(self.inner.read().await.last_purged.clone())
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), KeelError> {
        self.inner.write().await.vote = Some(vote);
        Ok(())
    }

    async fn read_vote(&self) -> Result<Option<Vote>, KeelError> {
        Ok(self.inner.read().await.vote.clone())
    }

    async fn save_committed(&self, marker: Option<Vec<u8>>) -> Result<(), KeelError> {
        self.inner.write().await.committed = marker;
        Ok(())
    }

    async fn read_committed(&self) -> Result<Option<Vec<u8>>, KeelError> {
        Ok(self.inner.read().await.committed.clone())
    }

    async fn flush(&self) -> Result<(), KeelError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
