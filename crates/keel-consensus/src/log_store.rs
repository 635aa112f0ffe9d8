//! [`RaftLogStorage`] over any [`keel_storage::LogStorage`].

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use keel_storage::{LogRecord, LogStorage};
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, RaftLogReader, StorageIOError};

use crate::types::{Entry, LogId, StorageError, TypeConfig, Vote};

/// Entries are stored as serde_json payloads; the purged and committed log
/// ids as serde_json markers.
pub struct LogStoreAdapter<S> {
    storage: Arc<S>,
}

impl<S> LogStoreAdapter<S> {
    pub fn new(storage: Arc<S>) -> Self {
        LogStoreAdapter { storage }
    }
}

impl<S> Clone for LogStoreAdapter<S> {
    fn clone(&self) -> Self {
        LogStoreAdapter { storage: Arc::clone(&self.storage) }
    }
}

/// Inclusive `(from, to)` for a range of log indices, or `None` when empty.
fn index_range<RB: RangeBounds<u64>>(range: &RB) -> Option<(u64, u64)> {
    let from = match range.start_bound() {
        Bound::Included(&i) => i,
        Bound::Excluded(&i) => i.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let to = match range.end_bound() {
        Bound::Included(&i) => i,
        Bound::Excluded(&i) => i.checked_sub(1)?,
        Bound::Unbounded => u64::MAX,
    };
    (from <= to).then_some((from, to))
}

fn decode_entry(record: &LogRecord) -> Result<Entry, StorageError> {
    serde_json::from_slice(&record.payload).map_err(|e| StorageIOError::read_logs(&e).into())
}

fn decode_log_id(bytes: Option<Vec<u8>>) -> Result<Option<LogId>, StorageError> {
    match bytes {
        Some(b) => {
            serde_json::from_slice(&b).map(Some).map_err(|e| StorageIOError::read_logs(&e).into())
        }
        None => Ok(None),
    }
}

impl<S: LogStorage> RaftLogReader<TypeConfig> for LogStoreAdapter<S> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError> {
        let Some((from, to)) = index_range(&range) else {
            return Ok(Vec::new());
        };
        let records =
            self.storage.get_entries(from, to).await.map_err(|e| StorageIOError::read_logs(&e))?;
        records.iter().map(decode_entry).collect()
    }
}

impl<S: LogStorage> RaftLogStorage<TypeConfig> for LogStoreAdapter<S> {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError> {
        let purged = self.storage.last_purged().await.map_err(|e| StorageIOError::read_logs(&e))?;
        let last_purged_log_id = decode_log_id(purged)?;
        let last = self.storage.last_entry().await.map_err(|e| StorageIOError::read_logs(&e))?;
        let last_log_id = match last {
            Some(record) => Some(decode_entry(&record)?.log_id),
            None => last_purged_log_id,
        };
        Ok(LogState { last_purged_log_id, last_log_id })
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError> {
        let marker = committed
            .map(|id| serde_json::to_vec(&id))
            .transpose()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.storage.save_committed(marker).await.map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError> {
        let marker =
            self.storage.read_committed().await.map_err(|e| StorageIOError::read_logs(&e))?;
        decode_log_id(marker)
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        let stored = keel_storage::Vote {
            term: vote.leader_id().term,
            voted_for: Some(vote.leader_id().node_id),
            committed: vote.is_committed(),
        };
        self.storage.save_vote(stored).await.map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError> {
        let stored = self.storage.read_vote().await.map_err(|e| StorageIOError::read_vote(&e))?;
        Ok(stored.map(|v| {
            let mut vote = Vote::new(v.term, v.voted_for.unwrap_or_default());
            if v.committed {
                vote.commit();
            }
            vote
        }))
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry>,
    {
        let mut records = Vec::new();
        for entry in entries {
            let payload = serde_json::to_vec(&entry).map_err(|e| StorageIOError::write_logs(&e))?;
            records.push(LogRecord { index: entry.log_id.index, payload });
        }
        self.storage.append(records).await.map_err(|e| StorageIOError::write_logs(&e))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(%log_id, "truncate log");
        self.storage.truncate(log_id.index).await.map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(%log_id, "purge log");
        let marker = serde_json::to_vec(&log_id).map_err(|e| StorageIOError::write_logs(&e))?;
        self.storage.purge(log_id.index, marker).await.map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
