use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_types::KeelError;

use crate::keys::{meta_key, raft_log_index, raft_log_key};
use crate::traits::{LogStorage, StorageEngine};
use crate::types::{LogRecord, Partition, Vote, WriteOp};
use crate::{decode, encode};

fn fjall_err(e: fjall::Error) -> KeelError {
    KeelError::Io(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> KeelError {
    KeelError::Io(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallEngine: document engine
// ---------------------------------------------------------------------------

/// Document engine backed by fjall.
///
/// Both partitions live in a single fjall `Database` so that write batches
/// spanning documents and the applied marker are atomic.
pub struct FjallEngine {
    db: fjall::Database,
    /// `"{collection}:{id}"` → bincode(Document)
    documents: fjall::Keyspace,
    /// label → opaque bytes
    meta: fjall::Keyspace,
    closed: AtomicBool,
}

impl FjallEngine {
    /// Open (or create) an engine at `path`.
    pub fn open(path: &Path) -> Result<Self, KeelError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let documents =
            db.keyspace("documents", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(FjallEngine { db, documents, meta, closed: AtomicBool::new(false) })
    }

    fn keyspace(&self, partition: Partition) -> &fjall::Keyspace {
        match partition {
            Partition::Documents => &self.documents,
            Partition::Meta => &self.meta,
        }
    }

    fn ensure_open(&self) -> Result<(), KeelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeelError::Unavailable("store closed".into()));
        }
        Ok(())
    }
}

impl StorageEngine for FjallEngine {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, KeelError> {
        self.ensure_open()?;
        Ok(self.keyspace(partition).get(key).map_err(fjall_err)?.map(|v| v.to_vec()))
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
        self.keyspace(partition)
            .prefix(prefix.to_vec())
            .skip(offset)
            .take(limit)
            .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
            .collect()
    }

    fn count_prefix(&self, partition: Partition, prefix: &[u8]) -> Result<usize, KeelError> {
        self.ensure_open()?;
        let mut count = 0usize;
        for guard in self.keyspace(partition).prefix(prefix.to_vec()) {
            guard.into_inner().map_err(fjall_err)?;
            count += 1;
        }
        Ok(count)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), KeelError> {
        self.ensure_open()?;
        let mut batch = self.db.batch();
        for op in ops {
            match op {
                WriteOp::Put { partition, key, value } => {
                    batch.insert(self.keyspace(partition), key, value)
                }
                WriteOp::Delete { partition, key } => batch.remove(self.keyspace(partition), key),
            }
        }
        batch.commit().map_err(fjall_err)
    }

    fn health(&self) -> Result<(), KeelError> {
        self.ensure_open()?;
        self.meta
            .get(meta_key("health"))
            .map(|_| ())
            .map_err(|e| KeelError::Unavailable(e.to_string()))
    }

    fn close(&self) -> Result<(), KeelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// Keyspaces of the consensus log database, kept apart from documents.
pub struct FjallLogStore {
    db: fjall::Database,
    /// `index(8)` → entry payload
    raft_log: fjall::Keyspace,
    /// label → bincode(value) or opaque marker
    meta: fjall::Keyspace,
}

impl FjallLogStore {
    pub fn open(path: &Path) -> Result<Arc<Self>, KeelError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallLogStore { db, raft_log, meta }))
    }

    fn read_meta(&self, label: &str) -> Result<Option<Vec<u8>>, KeelError> {
        Ok(self.meta.get(meta_key(label)).map_err(fjall_err)?.map(|b| b.to_vec()))
    }

    fn collect_keys(&self, from: u64, to_inclusive: u64) -> Result<Vec<Vec<u8>>, KeelError> {
        let start = raft_log_key(from).to_vec();
        let end = raft_log_key(to_inclusive).to_vec();
        self.raft_log
            .range(start..=end)
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStorage(pub Arc<FjallLogStore>);

impl FjallLogStorage {
    pub fn open(path: &Path) -> Result<Self, KeelError> {
        Ok(FjallLogStorage(FjallLogStore::open(path)?))
    }
}

impl LogStorage for FjallLogStorage {
    async fn last_entry(&self) -> Result<Option<LogRecord>, KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LogRecord>, KeelError> {
            let start = raft_log_key(0).to_vec();
            let end = raft_log_key(u64::MAX).to_vec();
            match store.raft_log.range(start..=end).last() {
                Some(guard) => {
                    let (k, v) = guard.into_inner().map_err(fjall_err)?;
                    Ok(Some(LogRecord { index: raft_log_index(&k)?, payload: v.to_vec() }))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogRecord>, KeelError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogRecord>, KeelError> {
            let start = raft_log_key(from).to_vec();
            let end = raft_log_key(to_inclusive).to_vec();
            store
                .raft_log
                .range(start..=end)
                .map(|g| {
                    let (k, v) = g.into_inner().map_err(fjall_err)?;
                    Ok(LogRecord { index: raft_log_index(&k)?, payload: v.to_vec() })
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, entries: Vec<LogRecord>) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KeelError> {
            let mut batch = store.db.batch();
            for entry in entries {
                batch.insert(&store.raft_log, raft_log_key(entry.index).to_vec(), entry.payload);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate(&self, from_index: u64) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KeelError> {
            let keys = store.collect_keys(from_index, u64::MAX)?;
            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.raft_log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, up_to_index: u64, marker: Vec<u8>) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KeelError> {
            let keys = store.collect_keys(0, up_to_index)?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, meta_key("last_purged"), marker);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn last_purged(&self) -> Result<Option<Vec<u8>>, KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.read_meta("last_purged"))
            .await
            .map_err(join_err)?
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KeelError> {
            store.meta.insert(meta_key("vote"), encode(&vote)?).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_vote(&self) -> Result<Option<Vote>, KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vote>, KeelError> {
            store.read_meta("vote")?.map(|b| decode::<Vote>(&b)).transpose()
        })
        .await
        .map_err(join_err)?
    }

    async fn save_committed(&self, marker: Option<Vec<u8>>) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KeelError> {
            match marker {
                Some(m) => store.meta.insert(meta_key("committed"), m).map_err(fjall_err),
                None => store.meta.remove(meta_key("committed")).map_err(fjall_err),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn read_committed(&self) -> Result<Option<Vec<u8>>, KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.read_meta("committed"))
            .await
            .map_err(join_err)?
    }

    async fn flush(&self) -> Result<(), KeelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || {
            store.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
