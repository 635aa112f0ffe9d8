//! openraft type configuration.

use std::fmt;
use std::io::Cursor;

use keel_types::{ApplyResponse, LogEntry, NodeId};

/// Addresses of a consensus member, stored in the replicated membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeelNode {
    /// Client-facing address (document API).
    pub address: String,
    /// Address carrying consensus RPCs.
    pub raft_address: String,
}

impl KeelNode {
    pub fn new(address: impl Into<String>, raft_address: impl Into<String>) -> Self {
        KeelNode { address: address.into(), raft_address: raft_address.into() }
    }
}

impl fmt::Display for KeelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(raft={})", self.address, self.raft_address)
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogEntry,
        R = ApplyResponse,
        Node = KeelNode,
);

pub type KeelRaft = openraft::Raft<TypeConfig>;
pub type Entry = openraft::Entry<TypeConfig>;
pub type LogId = openraft::LogId<NodeId>;
pub type Vote = openraft::Vote<NodeId>;
pub type StoredMembership = openraft::StoredMembership<NodeId, KeelNode>;
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, KeelNode>;
pub type Snapshot = openraft::storage::Snapshot<TypeConfig>;
pub type StorageError = openraft::StorageError<NodeId>;
pub type RaftMetrics = openraft::RaftMetrics<NodeId, KeelNode>;

pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, KeelNode, RaftError<E>>;
pub type ClientWriteError = openraft::error::ClientWriteError<NodeId, KeelNode>;
pub type InitializeError = openraft::error::InitializeError<NodeId, KeelNode>;
pub type CheckIsLeaderError = openraft::error::CheckIsLeaderError<NodeId, KeelNode>;

/// Position of the last entry reflected in the state machine, persisted
/// as the storage crate's opaque applied marker.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct AppliedState {
    pub last_applied: Option<LogId>,
    pub membership: StoredMembership,
}
