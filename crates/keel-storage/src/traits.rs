use std::future::Future;

use keel_types::KeelError;

use crate::types::{LogRecord, Partition, Vote, WriteOp};

/// Key-value engine underneath [`crate::LocalStore`].
///
/// Methods are blocking; `LocalStore` calls them from
/// `tokio::task::spawn_blocking`. The trait is object safe so a store can
/// hold `Arc<dyn StorageEngine>` regardless of backend.
pub trait StorageEngine: Send + Sync + 'static {
    fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, KeelError>;

    /// Entries whose key starts with `prefix`, ascending by key, after
    /// skipping `offset` of them. `limit == 0` means unbounded.
    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KeelError>;

    fn count_prefix(&self, partition: Partition, prefix: &[u8]) -> Result<usize, KeelError>;

    /// Apply all `ops` atomically, in order.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), KeelError>;

    /// Cheap read against the engine. Fails with `Unavailable` once closed.
    fn health(&self) -> Result<(), KeelError>;

    /// Make pending writes durable, then refuse further operations.
    /// Idempotent.
    fn close(&self) -> Result<(), KeelError>;
}

/// Persistent storage for the consensus log and its metadata.
///
/// Markers such as the last purged log id are opaque bytes here; the
/// adapter in `keel-consensus` owns their encoding.
pub trait LogStorage: Send + Sync + 'static {
    /// The entry with the highest index, if any.
    fn last_entry(&self) -> impl Future<Output = Result<Option<LogRecord>, KeelError>> + Send;

    /// All entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(
        &self,
        from: u64,
        to_inclusive: u64,
    ) -> impl Future<Output = Result<Vec<LogRecord>, KeelError>> + Send;

    /// Append entries, overwriting any existing entry at the same index.
    fn append(&self, entries: Vec<LogRecord>)
        -> impl Future<Output = Result<(), KeelError>> + Send;

    /// Delete all entries with `index >= from_index` (conflict resolution).
    fn truncate(&self, from_index: u64) -> impl Future<Output = Result<(), KeelError>> + Send;

    /// Delete all entries with `index <= up_to_index` and record `marker`
    /// as the last purged position, atomically.
    fn purge(
        &self,
        up_to_index: u64,
        marker: Vec<u8>,
    ) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn last_purged(&self) -> impl Future<Output = Result<Option<Vec<u8>>, KeelError>> + Send;

    /// Durably persist the vote (called before granting a vote).
    fn save_vote(&self, vote: Vote) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn read_vote(&self) -> impl Future<Output = Result<Option<Vote>, KeelError>> + Send;

    fn save_committed(
        &self,
        marker: Option<Vec<u8>>,
    ) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn read_committed(&self) -> impl Future<Output = Result<Option<Vec<u8>>, KeelError>> + Send;

    /// Sync everything written so far to stable storage.
    fn flush(&self) -> impl Future<Output = Result<(), KeelError>> + Send;
}
