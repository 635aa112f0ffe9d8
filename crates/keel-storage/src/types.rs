use keel_types::Document;

/// A single entry in the consensus log. `payload` is opaque to this crate;
/// keel-consensus owns its encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub index: u64,
    pub payload: Vec<u8>,
}

/// Persisted vote, written before granting a vote in an election.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Vote {
    pub term: u64,
    /// `None` means the node has not voted yet in this term.
    pub voted_for: Option<u64>, // NodeId
    /// `true` once the leader for this term has been committed (quorum formed).
    pub committed: bool,
}

/// Partitions of a document engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// `"{collection}:{id}"` → bincode(Document)
    Documents,
    /// label → opaque bytes (applied marker)
    Meta,
}

/// One mutation inside an atomic [`crate::StorageEngine::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { partition: Partition, key: Vec<u8>, value: Vec<u8> },
    Delete { partition: Partition, key: Vec<u8> },
}

/// A full state-machine snapshot.
///
/// `applied` is the consensus marker of the last entry reflected in `data`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub applied: Option<Vec<u8>>,
    /// bincode-serialized [`SnapshotContents`].
    pub data: Vec<u8>,
}

/// Internal serialized format stored in [`Snapshot::data`]: every document
/// of every collection, in key order, plus the applied marker.
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub documents: Vec<(String, Document)>,
    pub applied: Option<Vec<u8>>,
}
