//! In-process raft network. Every registered node is reachable by calling
//! its `Raft` handle directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_types::NodeId;
use openraft::error::{InstallSnapshotError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::RwLock;

use crate::types::{KeelNode, KeelRaft, RPCError, RaftError, TypeConfig};

#[derive(Clone, Default)]
pub struct Router {
    nodes: Arc<RwLock<BTreeMap<NodeId, KeelRaft>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, raft: KeelRaft) {
        self.nodes.write().insert(id, raft);
    }

    /// Make `id` unreachable from every other node.
    pub fn unregister(&self, id: NodeId) {
        self.nodes.write().remove(&id);
    }
}

pub struct RouterConnection {
    target: NodeId,
    router: Router,
}

impl RouterConnection {
    fn target_raft(&self) -> Result<KeelRaft, Unreachable> {
        self.router.nodes.read().get(&self.target).cloned().ok_or_else(|| {
            let err = std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("node {} not registered", self.target),
            );
            Unreachable::new(&err)
        })
    }

    fn remote<E: std::error::Error>(&self, e: RaftError<E>) -> RPCError<E> {
        RPCError::RemoteError(RemoteError::new(self.target, e))
    }
}

impl RaftNetworkFactory<TypeConfig> for Router {
    type Network = RouterConnection;

    async fn new_client(&mut self, target: NodeId, _node: &KeelNode) -> Self::Network {
        RouterConnection { target, router: self.clone() }
    }
}

impl RaftNetwork<TypeConfig> for RouterConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError> {
        let raft = self.target_raft().map_err(RPCError::Unreachable)?;
        raft.append_entries(rpc).await.map_err(|e| self.remote(e))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        let raft = self.target_raft().map_err(RPCError::Unreachable)?;
        raft.install_snapshot(rpc).await.map_err(|e| self.remote(e))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError> {
        let raft = self.target_raft().map_err(RPCError::Unreachable)?;
        raft.vote(rpc).await.map_err(|e| self.remote(e))
    }
}
