//! gRPC transport for outbound consensus RPCs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keel_consensus::{KeelNode, TypeConfig};
use keel_proto::v1::{raft_service_client::RaftServiceClient, RaftMessage};
use keel_types::NodeId;
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tonic::transport::{Channel, Endpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type RpcResult<T, E = openraft::error::Infallible> =
    Result<T, RPCError<NodeId, KeelNode, RaftError<NodeId, E>>>;

/// Channels are created lazily per target and cached; a failed call evicts
/// the target's channel so the next one reconnects.
#[derive(Clone, Default)]
pub struct GrpcNetwork {
    channels: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl GrpcNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, target: NodeId, addr: &str) -> Result<Channel, tonic::transport::Error> {
        if let Some(channel) = self.channels.read().get(&target) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        self.channels.write().insert(target, channel.clone());
        Ok(channel)
    }

    fn evict(&self, target: NodeId) {
        self.channels.write().remove(&target);
    }
}

impl RaftNetworkFactory<TypeConfig> for GrpcNetwork {
    type Network = GrpcConnection;

    async fn new_client(&mut self, target: NodeId, node: &KeelNode) -> Self::Network {
        GrpcConnection { target, addr: node.raft_address.clone(), network: self.clone() }
    }
}

pub struct GrpcConnection {
    target: NodeId,
    addr: String,
    network: GrpcNetwork,
}

#[derive(Clone, Copy)]
enum Rpc {
    AppendEntries,
    Vote,
    InstallSnapshot,
}

impl GrpcConnection {
    async fn call<Req, Resp, E>(&self, rpc: Rpc, req: &Req) -> RpcResult<Resp, E>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let channel = self
            .network
            .channel(self.target, &self.addr)
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        let data = serde_json::to_vec(req).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let mut client = RaftServiceClient::new(channel);
        let message = RaftMessage { data };
        let response = match rpc {
            Rpc::AppendEntries => client.append_entries(message).await,
            Rpc::Vote => client.vote(message).await,
            Rpc::InstallSnapshot => client.install_snapshot(message).await,
        };
        let response = response.map_err(|status| {
            tracing::debug!(
                target_node = self.target,
                addr = %self.addr,
                %status,
                "raft rpc failed"
            );
            self.network.evict(self.target);
            RPCError::Unreachable(Unreachable::new(&status))
        })?;

        let result: Result<Resp, RaftError<NodeId, E>> =
            serde_json::from_slice(&response.into_inner().data)
                .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for GrpcConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>> {
        self.call(Rpc::AppendEntries, &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, InstallSnapshotError> {
        self.call(Rpc::InstallSnapshot, &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> RpcResult<VoteResponse<NodeId>> {
        self.call(Rpc::Vote, &req).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    use keel_cluster::{ClusterMember, DistributedConfig, DistributedStore, StaticMembership};
    use keel_consensus::{ConsensusConfig, ConsensusEngine, RaftEngine, DEFAULT_APPLY_TIMEOUT};
    use keel_storage::{CacheConfig, LocalStore, MemLogStorage, StateMachine};
    use keel_types::{fields, LogEntry, Operation};
    use openraft::raft::AppendEntriesRequest;
    use openraft::Vote;
    use tokio::sync::watch;

    use super::*;
    use crate::serve_cluster;

    struct TestNode {
        engine: Arc<RaftEngine>,
        _stop: watch::Sender<bool>,
    }

    fn free_addr() -> SocketAddr {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
    }

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            snapshot_threshold: 10,
            snapshot_logs_to_keep: 0,
            ..Default::default()
        }
    }

    fn option() -> RPCOption {
        RPCOption::new(Duration::from_secs(1))
    }

    /// Raft core plus `serve_cluster` on the node's address from `addrs`.
    async fn spawn_node(id: NodeId, addrs: &BTreeMap<NodeId, SocketAddr>) -> TestNode {
        let members = addrs
            .iter()
            .map(|(id, addr)| (*id, KeelNode::new(format!("client-{id}"), addr.to_string())))
            .collect();
        let store = LocalStore::in_memory(CacheConfig::default());
        let sm = Arc::new(StateMachine::new(store.clone()));
        let log = Arc::new(MemLogStorage::new());
        let engine = RaftEngine::start(id, &config(), members, GrpcNetwork::new(), log, sm)
            .await
            .unwrap();
        let engine = Arc::new(engine);
        let local = ClusterMember::alive(id, format!("client-{id}"), addrs[&id].to_string());
        let membership = Arc::new(StaticMembership::new(local, Vec::new()));
        let cluster = DistributedConfig::default();
        let db = Arc::new(DistributedStore::new(store, Arc::clone(&engine), membership, cluster));

        let (stop, mut stopped) = watch::channel(false);
        let shutdown = async move {
            let _ = stopped.wait_for(|s| *s).await;
        };
        tokio::spawn(serve_cluster(addrs[&id], engine.raft().clone(), db, shutdown));
        TestNode { engine, _stop: stop }
    }

    async fn find_leader(nodes: &[&TestNode]) -> usize {
        for _ in 0..400 {
            if let Some(i) = nodes.iter().position(|n| n.engine.is_leader()) {
                return i;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no leader elected");
    }

    async fn wait_applied(engine: &RaftEngine, index: u64) {
        engine
            .raft()
            .wait(Some(Duration::from_secs(15)))
            .metrics(|m| m.last_applied.map(|l| l.index) >= Some(index), "applied")
            .await
            .unwrap();
    }

    fn insert(id: &str) -> LogEntry {
        LogEntry {
            operation: Operation::Insert {
                collection: "users".into(),
                id: id.into(),
                fields: fields! { "name" => id },
            },
            timestamp_ns: 7,
            request_id: format!("req-{id}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_nodes_replicate_over_grpc_and_late_node_catches_up() {
        let addrs: BTreeMap<NodeId, SocketAddr> = (1..=3).map(|id| (id, free_addr())).collect();
        let n1 = spawn_node(1, &addrs).await;
        let n2 = spawn_node(2, &addrs).await;
        n1.engine.bootstrap().await.unwrap();

        let pair = [&n1, &n2];
        let leader = pair[find_leader(&pair).await].engine.clone();
        for i in 0..25 {
            let entry = insert(&format!("u{i:02}"));
            let resp = leader.apply_log(entry, DEFAULT_APPLY_TIMEOUT).await.unwrap();
            assert!(resp.success);
        }
        let last = leader.status().last_applied_index.unwrap_or_default();
        for node in pair {
            wait_applied(&node.engine, last).await;
            assert_eq!(node.engine.state_machine().store().count("users").await.unwrap(), 25);
        }

        // Node 3 starts after the leader compacted its log.
        let n3 = spawn_node(3, &addrs).await;
        wait_applied(&n3.engine, last).await;
        let expected = leader.state_machine().snapshot().await.unwrap();
        let caught_up = n3.engine.state_machine().snapshot().await.unwrap();
        assert_eq!(caught_up.data, expected.data);

        for node in [&n1, &n2, &n3] {
            node.engine.shutdown().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn vote_and_append_round_trip() {
        let addrs = BTreeMap::from([(1, free_addr())]);
        let node = spawn_node(1, &addrs).await;

        let mut network = GrpcNetwork::new();
        let target = KeelNode::new("client-1", addrs[&1].to_string());
        let mut conn = network.new_client(1, &target).await;
        let req = VoteRequest::new(Vote::new(1, 2), None);
        let mut granted = None;
        for _ in 0..50 {
            match conn.vote(req.clone(), option()).await {
                Err(RPCError::Unreachable(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                other => {
                    granted = Some(other.unwrap());
                    break;
                }
            }
        }
        assert!(granted.unwrap().vote_granted);

        let append = AppendEntriesRequest {
            vote: Vote::new_committed(1, 2),
            prev_log_id: None,
            entries: Vec::new(),
            leader_commit: None,
        };
        let resp = conn.append_entries(append, option()).await.unwrap();
        assert!(matches!(resp, AppendEntriesResponse::Success));
        node.engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_peer_replies_with_remote_error() {
        let addrs = BTreeMap::from([(1, free_addr())]);
        let node = spawn_node(1, &addrs).await;
        node.engine.shutdown().await.unwrap();

        let mut network = GrpcNetwork::new();
        let target = KeelNode::new("client-1", addrs[&1].to_string());
        let mut conn = network.new_client(1, &target).await;
        let req = VoteRequest::new(Vote::new(1, 2), None);
        let mut outcome = None;
        for _ in 0..50 {
            match conn.vote(req.clone(), option()).await {
                Err(RPCError::Unreachable(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                other => {
                    outcome = Some(other);
                    break;
                }
            }
        }
        assert!(matches!(outcome, Some(Err(RPCError::RemoteError(_)))));

        let absent = KeelNode::new("client-9", free_addr().to_string());
        let mut nobody = network.new_client(9, &absent).await;
        assert!(matches!(nobody.vote(req, option()).await, Err(RPCError::Unreachable(_))));
    }
}
