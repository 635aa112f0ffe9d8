use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use keel_storage::{LogStorage, StateMachine};
use keel_types::{ApplyResponse, KeelError, LogEntry, NodeId, Role};
use openraft::error::RaftError as OpenRaftError;
use openraft::metrics::WaitError;
use openraft::network::RaftNetworkFactory;
use openraft::{Config, Raft, ServerState, SnapshotPolicy};

use crate::log_store::LogStoreAdapter;
use crate::state_machine::KeelStateMachine;
use crate::types::{
    CheckIsLeaderError, ClientWriteError, InitializeError, KeelNode, KeelRaft, RaftMetrics,
    TypeConfig,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Build a snapshot after this many applied entries since the last one.
    pub snapshot_threshold: u64,
    /// Applied entries kept in the log after a snapshot.
    pub snapshot_logs_to_keep: u64,
    pub apply_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 1000,
            snapshot_threshold: 5000,
            snapshot_logs_to_keep: 1000,
            apply_timeout_ms: DEFAULT_APPLY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConsensusConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    fn to_raft_config(&self) -> Result<Config, KeelError> {
        Config {
            cluster_name: "keel".to_string(),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.snapshot_logs_to_keep,
            ..Default::default()
        }
        .validate()
        .map_err(|e| KeelError::InvalidArgument(format!("raft config: {e}")))
    }
}

// ---------------------------------------------------------------------------
// ConsensusEngine trait
// RPITIT with `+ Send` futures so generic callers can await across threads.
// ---------------------------------------------------------------------------

/// Point-in-time view of the local consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub last_log_index: Option<u64>,
    pub last_applied_index: Option<u64>,
}

pub trait ConsensusEngine: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Initialize the group with the configured initial members. A node
    /// that is already part of an initialized group treats this as success.
    fn bootstrap(&self) -> impl Future<Output = Result<(), KeelError>> + Send;

    /// Replicate `entry` and return the state machine's result once it is
    /// committed and applied locally.
    fn apply_log(
        &self,
        entry: LogEntry,
        timeout: Duration,
    ) -> impl Future<Output = Result<ApplyResponse, KeelError>> + Send;

    fn wait_for_leader(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn is_leader(&self) -> bool;

    /// Confirm leadership with a quorum, then wait until every entry
    /// committed before the call is applied locally. `LeaderRequired` on a
    /// node that is not the leader.
    fn read_barrier(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), KeelError>> + Send;

    /// Client-facing address of the current leader, if one is known.
    fn leader_address(&self) -> Option<String>;

    fn status(&self) -> ConsensusStatus;

    fn role(&self) -> Role {
        self.status().role
    }

    fn shutdown(&self) -> impl Future<Output = Result<(), KeelError>> + Send;
}

// ---------------------------------------------------------------------------
// RaftEngine: openraft-backed implementation
// ---------------------------------------------------------------------------

type FlushFuture = Pin<Box<dyn Future<Output = Result<(), KeelError>> + Send>>;

pub struct RaftEngine {
    node_id: NodeId,
    raft: KeelRaft,
    state_machine: Arc<KeelStateMachine>,
    initial_members: BTreeMap<NodeId, KeelNode>,
    /// Syncs the log storage handed to [`RaftEngine::start`].
    flush_log: Box<dyn Fn() -> FlushFuture + Send + Sync>,
}

impl RaftEngine {
    /// Start the raft core. `initial_members` is only used by [`ConsensusEngine::bootstrap`].
    pub async fn start<N, S>(
        node_id: NodeId,
        config: &ConsensusConfig,
        initial_members: BTreeMap<NodeId, KeelNode>,
        network: N,
        log_storage: Arc<S>,
        state_machine: Arc<StateMachine>,
    ) -> Result<Self, KeelError>
    where
        N: RaftNetworkFactory<TypeConfig>,
        S: LogStorage,
    {
        let raft_config = Arc::new(config.to_raft_config()?);
        let state_machine = KeelStateMachine::open(state_machine).await?;
        let flush_target = Arc::clone(&log_storage);
        let flush_log = Box::new(move || -> FlushFuture {
            let storage = Arc::clone(&flush_target);
            Box::pin(async move { storage.flush().await })
        });
        let raft = Raft::new(
            node_id,
            raft_config,
            network,
            LogStoreAdapter::new(log_storage),
            Arc::clone(&state_machine),
        )
        .await
        .map_err(|e| KeelError::Consensus(format!("failed to start raft: {e}")))?;

        tracing::info!(node_id, members = initial_members.len(), "consensus engine started");
        Ok(RaftEngine { node_id, raft, state_machine, initial_members, flush_log })
    }

    /// The raft handle, for serving inbound consensus RPCs.
    pub fn raft(&self) -> &KeelRaft {
        &self.raft
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        self.state_machine.inner()
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub async fn trigger_snapshot(&self) -> Result<(), KeelError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| KeelError::Consensus(format!("snapshot: {e}")))
    }
}

fn role_of(state: ServerState) -> Role {
    match state {
        ServerState::Leader => Role::Leader,
        ServerState::Follower => Role::Follower,
        ServerState::Candidate => Role::Candidate,
        ServerState::Learner => Role::Learner,
        ServerState::Shutdown => Role::Shutdown,
    }
}

fn write_error(e: OpenRaftError<NodeId, ClientWriteError>) -> KeelError {
    match e {
        OpenRaftError::APIError(ClientWriteError::ForwardToLeader(f)) => {
            KeelError::NotLeader { leader: f.leader_node.map(|n| n.address) }
        }
        other => KeelError::ApplyFailed(other.to_string()),
    }
}

impl ConsensusEngine for RaftEngine {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn bootstrap(&self) -> Result<(), KeelError> {
        match self.raft.initialize(self.initial_members.clone()).await {
            Ok(()) => {
                let members: Vec<_> = self.initial_members.keys().collect();
                tracing::info!(node_id = self.node_id, ?members, "cluster bootstrapped");
                Ok(())
            }
            Err(OpenRaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::info!(node_id = self.node_id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(KeelError::Consensus(format!("bootstrap: {e}"))),
        }
    }

    async fn apply_log(
        &self,
        entry: LogEntry,
        timeout: Duration,
    ) -> Result<ApplyResponse, KeelError> {
        if !self.is_leader() {
            return Err(KeelError::NotLeader { leader: self.leader_address() });
        }
        let request_id = entry.request_id.clone();
        match tokio::time::timeout(timeout, self.raft.client_write(entry)).await {
            Ok(Ok(resp)) => {
                tracing::debug!(%request_id, index = resp.log_id.index, "entry applied");
                Ok(resp.data)
            }
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => {
                tracing::warn!(%request_id, ?timeout, "apply timed out");
                Err(KeelError::Timeout)
            }
        }
    }

    async fn wait_for_leader(&self, timeout: Duration) -> Result<(), KeelError> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map(|_| ())
            .map_err(|e| match e {
                WaitError::Timeout(..) => KeelError::Timeout,
                other => KeelError::Consensus(other.to_string()),
            })
    }

    fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    async fn read_barrier(&self, timeout: Duration) -> Result<(), KeelError> {
        if !self.is_leader() {
            return Err(KeelError::LeaderRequired);
        }
        match tokio::time::timeout(timeout, self.raft.ensure_linearizable()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(OpenRaftError::APIError(CheckIsLeaderError::ForwardToLeader(_)))) => {
                Err(KeelError::LeaderRequired)
            }
            Ok(Err(e)) => Err(KeelError::Unavailable(format!("read barrier: {e}"))),
            Err(_) => Err(KeelError::Timeout),
        }
    }

    fn leader_address(&self) -> Option<String> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        let address = metrics
            .membership_config
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.address.clone());
        address
    }

    fn status(&self) -> ConsensusStatus {
        let m = self.metrics();
        ConsensusStatus {
            role: role_of(m.state),
            term: m.current_term,
            leader_id: m.current_leader,
            last_log_index: m.last_log_index,
            last_applied_index: m.last_applied.map(|l| l.index),
        }
    }

    async fn shutdown(&self) -> Result<(), KeelError> {
        let stopped =
            self.raft.shutdown().await.map_err(|e| KeelError::Consensus(format!("shutdown: {e}")));
        (self.flush_log)().await?;
        stopped?;
        tracing::info!(node_id = self.node_id, "consensus engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_storage::{CacheConfig, LocalStore, MemLogStorage};
    use keel_types::{fields, Operation};

    use super::*;
    use crate::router::Router;

    fn test_config() -> ConsensusConfig {
        ConsensusConfig {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            ..Default::default()
        }
    }

    fn keel_node(id: NodeId) -> KeelNode {
        KeelNode::new(format!("client-{id}"), format!("raft-{id}"))
    }

    fn members(ids: &[NodeId]) -> BTreeMap<NodeId, KeelNode> {
        ids.iter().map(|&id| (id, keel_node(id))).collect()
    }

    fn in_memory_sm() -> Arc<StateMachine> {
        Arc::new(StateMachine::new(LocalStore::in_memory(CacheConfig::default())))
    }

    async fn start_node(
        id: NodeId,
        config: &ConsensusConfig,
        ids: &[NodeId],
        router: &Router,
        log: Arc<MemLogStorage>,
        sm: Arc<StateMachine>,
    ) -> RaftEngine {
        let engine =
            RaftEngine::start(id, config, members(ids), router.clone(), log, sm).await.unwrap();
        router.register(id, engine.raft().clone());
        engine
    }

    fn insert(id: &str) -> LogEntry {
        LogEntry {
            operation: Operation::Insert {
                collection: "users".into(),
                id: id.into(),
                fields: fields! { "name" => id },
            },
            timestamp_ns: 42,
            request_id: format!("req-{id}"),
        }
    }

    fn rename(id: &str, name: &str) -> LogEntry {
        LogEntry {
            operation: Operation::Update {
                collection: "users".into(),
                id: id.into(),
                fields: fields! { "name" => name },
            },
            timestamp_ns: 43,
            request_id: format!("req-rename-{id}"),
        }
    }

    async fn find_leader(engines: &[RaftEngine]) -> usize {
        for _ in 0..200 {
            if let Some(i) = engines.iter().position(|e| e.is_leader()) {
                return i;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no leader elected");
    }

    async fn wait_applied(engine: &RaftEngine, index: u64) {
        engine
            .raft()
            .wait(Some(Duration::from_secs(10)))
            .metrics(|m| m.last_applied.map(|l| l.index) >= Some(index), "applied")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn single_node_bootstrap_and_apply() {
        let router = Router::new();
        let log = Arc::new(MemLogStorage::new());
        let engine = start_node(1, &test_config(), &[1], &router, log, in_memory_sm()).await;
        assert!(!engine.is_leader());

        engine.bootstrap().await.unwrap();
        engine.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        find_leader(std::slice::from_ref(&engine)).await;
        assert_eq!(engine.leader_address().as_deref(), Some("client-1"));
        assert_eq!(engine.role(), Role::Leader);

        let resp = engine.apply_log(insert("u1"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.version(), 1);

        let rejected = engine.apply_log(insert("u1"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        assert!(matches!(rejected.into_result(), Err(KeelError::AlreadyExists { .. })));

        let doc = engine.state_machine().store().get("users", "u1").await.unwrap();
        assert_eq!(doc.version, 1);

        engine.read_barrier(DEFAULT_APPLY_TIMEOUT).await.unwrap();

        // Second bootstrap on an initialized group is a no-op.
        engine.bootstrap().await.unwrap();

        let status = engine.status();
        assert_eq!(status.leader_id, Some(1));
        assert!(status.last_applied_index >= Some(3));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_leader_times_out_without_bootstrap() {
        let router = Router::new();
        let log = Arc::new(MemLogStorage::new());
        let engine = start_node(1, &test_config(), &[1], &router, log, in_memory_sm()).await;
        let err = engine.wait_for_leader(Duration::from_millis(300)).await.unwrap_err();
        assert_eq!(err, KeelError::Timeout);
        assert!(engine.leader_address().is_none());
        let err = engine.apply_log(insert("u1"), DEFAULT_APPLY_TIMEOUT).await.unwrap_err();
        assert_eq!(err, KeelError::NotLeader { leader: None });
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn three_nodes_replicate_and_reject_follower_writes() {
        let router = Router::new();
        let config = test_config();
        let ids = [1, 2, 3];
        let mut engines = Vec::new();
        for id in ids {
            let log = Arc::new(MemLogStorage::new());
            engines.push(start_node(id, &config, &ids, &router, log, in_memory_sm()).await);
        }
        engines[0].bootstrap().await.unwrap();
        let leader = find_leader(&engines).await;

        let mut last = 0;
        for i in 0..5 {
            let entry = insert(&format!("u{i}"));
            let resp = engines[leader].apply_log(entry, DEFAULT_APPLY_TIMEOUT).await.unwrap();
            assert!(resp.success);
            last = engines[leader].status().last_applied_index.unwrap_or_default();
        }

        for engine in &engines {
            wait_applied(engine, last).await;
            assert_eq!(engine.state_machine().store().count("users").await.unwrap(), 5);
        }

        let follower = (leader + 1) % engines.len();
        let err =
            engines[follower].apply_log(insert("x"), DEFAULT_APPLY_TIMEOUT).await.unwrap_err();
        let expected = format!("client-{}", engines[leader].node_id());
        assert_eq!(err, KeelError::NotLeader { leader: Some(expected) });
        assert!(!engines[follower].is_leader());
        assert_eq!(engines[follower].role(), Role::Follower);
        let barrier = engines[follower].read_barrier(DEFAULT_APPLY_TIMEOUT).await;
        assert_eq!(barrier.unwrap_err(), KeelError::LeaderRequired);
        engines[leader].read_barrier(DEFAULT_APPLY_TIMEOUT).await.unwrap();

        for engine in &engines {
            engine.shutdown().await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lagging_node_catches_up_to_identical_state() {
        let router = Router::new();
        let config =
            ConsensusConfig { snapshot_threshold: 10, snapshot_logs_to_keep: 0, ..test_config() };
        let ids = [1, 2, 3];
        let mut engines = Vec::new();
        for id in ids {
            let sm = in_memory_sm();
            let log = Arc::new(MemLogStorage::new());
            let engine = RaftEngine::start(id, &config, members(&ids), router.clone(), log, sm)
                .await
                .unwrap();
            if id != 3 {
                router.register(id, engine.raft().clone());
            }
            engines.push(engine);
        }
        engines[0].bootstrap().await.unwrap();
        let leader = find_leader(&engines[..2]).await;

        for i in 0..30 {
            let entry = insert(&format!("u{i:02}"));
            engines[leader].apply_log(entry, DEFAULT_APPLY_TIMEOUT).await.unwrap();
        }
        let last = engines[leader].status().last_applied_index.unwrap_or_default();

        router.register(3, engines[2].raft().clone());
        wait_applied(&engines[2], last).await;

        let expected = engines[leader].state_machine().snapshot().await.unwrap();
        let caught_up = engines[2].state_machine().snapshot().await.unwrap();
        assert_eq!(caught_up.data, expected.data);

        for engine in &engines {
            engine.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn restart_does_not_reapply() {
        let router = Router::new();
        let config = test_config();
        let log = Arc::new(MemLogStorage::new());
        let sm = in_memory_sm();

        let engine = start_node(1, &config, &[1], &router, Arc::clone(&log), Arc::clone(&sm)).await;
        engine.bootstrap().await.unwrap();
        find_leader(std::slice::from_ref(&engine)).await;
        engine.apply_log(insert("u1"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        engine.apply_log(rename("u1", "b"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        let applied = engine.status().last_applied_index;
        engine.shutdown().await.unwrap();
        router.unregister(1);

        let engine = start_node(1, &config, &[1], &router, log, Arc::clone(&sm)).await;
        find_leader(std::slice::from_ref(&engine)).await;
        assert!(engine.status().last_applied_index >= applied);
        let doc = sm.store().get("users", "u1").await.unwrap();
        assert_eq!(doc.version, 2);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fjall_restart_keeps_documents_vote_and_log() {
        use keel_storage::FjallLogStorage;

        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("documents");
        let raft = dir.path().join("raft");
        let config = test_config();
        let router = Router::new();

        let open = |router: &Router| {
            let store = LocalStore::open(&docs, CacheConfig::default()).unwrap();
            let log = Arc::new(FjallLogStorage::open(&raft).unwrap());
            let sm = Arc::new(StateMachine::new(store));
            let router = router.clone();
            let config = config.clone();
            async move {
                let engine = RaftEngine::start(1, &config, members(&[1]), router.clone(), log, sm)
                    .await
                    .unwrap();
                router.register(1, engine.raft().clone());
                engine
            }
        };

        let engine = open(&router).await;
        engine.bootstrap().await.unwrap();
        find_leader(std::slice::from_ref(&engine)).await;
        engine.apply_log(insert("u1"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        engine.apply_log(rename("u1", "b"), DEFAULT_APPLY_TIMEOUT).await.unwrap();
        let before = engine.metrics();
        let store = engine.state_machine().store().clone();
        engine.shutdown().await.unwrap();
        store.close().await.unwrap();
        router.unregister(1);
        drop(store);
        drop(engine);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let engine = open(&router).await;
        find_leader(std::slice::from_ref(&engine)).await;
        let after = engine.metrics();
        assert!(after.current_term >= before.current_term);
        assert!(after.last_log_index >= before.last_log_index);
        assert!(after.last_applied >= before.last_applied);

        let doc = engine.state_machine().store().get("users", "u1").await.unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.fields, fields! { "name" => "b" });
        engine.shutdown().await.unwrap();
    }
}
