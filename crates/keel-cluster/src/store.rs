use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keel_consensus::ConsensusEngine;
use keel_storage::{keys, LocalStore};
use keel_types::{
    ApplyResponse, CasRequest, CasResult, Document, Fields, KeelError, LogEntry, NodeId, Operation,
    ReadConsistency, Role,
};
use uuid::Uuid;

use crate::config::DistributedConfig;
use crate::membership::{ClusterMember, Membership};
use crate::readiness::{Readiness, ReadinessState};

/// Snapshot of this node's view of the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub node_id: NodeId,
    pub role: Role,
    pub is_leader: bool,
    pub leader_address: Option<String>,
    pub readiness: ReadinessState,
    pub alive_members: usize,
    pub members: Vec<ClusterMember>,
    pub term: u64,
    /// Index of the last entry reflected in the local store. Compare across
    /// replicas to see how stale a local read may be.
    pub last_applied_index: Option<u64>,
}

fn now_ns() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

/// Entry point for a replicated store node.
///
/// Writes go through the consensus log and are applied by every replica.
/// Reads are served from the local store; `Strong` reads are refused
/// unless this node leads. Nothing is served until the readiness protocol
/// reaches `Ready`.
pub struct DistributedStore<C, M> {
    store: LocalStore,
    consensus: Arc<C>,
    membership: Arc<M>,
    readiness: Readiness,
    config: DistributedConfig,
}

impl<C: ConsensusEngine, M: Membership> DistributedStore<C, M> {
    /// Wire the components without starting. Every operation fails with
    /// `NotReady` until [`Self::start`] completes.
    pub fn new(
        store: LocalStore,
        consensus: Arc<C>,
        membership: Arc<M>,
        config: DistributedConfig,
    ) -> Self {
        DistributedStore { store, consensus, membership, readiness: Readiness::new(), config }
    }

    /// [`Self::new`] followed by [`Self::start`].
    pub async fn open(
        store: LocalStore,
        consensus: Arc<C>,
        membership: Arc<M>,
        config: DistributedConfig,
    ) -> Result<Self, KeelError> {
        let this = Self::new(store, consensus, membership, config);
        this.start().await?;
        Ok(this)
    }

    /// Run the readiness protocol: join, wait for the minimum member count,
    /// bootstrap when configured, wait for a leader, then mark `Ready`.
    pub async fn start(&self) -> Result<(), KeelError> {
        let node_id = self.consensus.node_id();
        self.readiness.set(ReadinessState::Joining);
        self.membership.join(&self.config.seeds).await?;

        if self.config.min_cluster_size > 1 {
            self.readiness.set(ReadinessState::AwaitingMinimumMembers);
            self.wait_for_members(self.config.min_cluster_size, self.config.min_members_timeout())
                .await?;
        }

        if self.config.bootstrap {
            self.consensus.bootstrap().await?;
        }

        self.readiness.set(ReadinessState::AwaitingLeader);
        self.consensus.wait_for_leader(self.config.wait_for_leader_timeout()).await?;

        self.readiness.set(ReadinessState::Ready);
        tracing::info!(node_id, leader = ?self.consensus.leader_address(), "node ready");
        Ok(())
    }

    async fn wait_for_members(&self, min: usize, timeout: Duration) -> Result<(), KeelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let alive = self.membership.alive_member_count();
            if alive >= min {
                tracing::info!(alive, min, "minimum cluster size reached");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(alive, min, "timed out waiting for members");
                return Err(KeelError::Timeout);
            }
            tracing::debug!(alive, min, "waiting for members");
            tokio::time::sleep(self.config.member_poll_interval()).await;
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), KeelError> {
        self.readiness.wait_ready(timeout).await
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn readiness(&self) -> ReadinessState {
        self.readiness.state()
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn leader_address(&self) -> Option<String> {
        self.consensus.leader_address()
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.store
    }

    pub fn consensus(&self) -> &Arc<C> {
        &self.consensus
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.membership.members()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Readiness first, so every operation before `Ready` is `NotReady`.
    fn admit(&self, collection: &str, id: &str) -> Result<(), KeelError> {
        self.readiness.ensure_ready()?;
        keys::validate(collection, id)
    }

    async fn submit(&self, operation: Operation) -> Result<ApplyResponse, KeelError> {
        let entry = LogEntry {
            operation,
            timestamp_ns: now_ns(),
            request_id: Uuid::new_v4().to_string(),
        };
        tracing::debug!(
            op = entry.operation.kind(),
            collection = entry.operation.collection(),
            request_id = %entry.request_id,
            "submitting entry"
        );
        self.consensus.apply_log(entry, self.config.apply_timeout()).await
    }

    fn written(resp: ApplyResponse) -> Result<Document, KeelError> {
        resp.into_result()?
            .ok_or_else(|| KeelError::ApplyFailed("apply returned no document".into()))
    }

    pub async fn insert(&self, collection: &str, doc: Document) -> Result<Document, KeelError> {
        self.admit(collection, &doc.id)?;
        let op =
            Operation::Insert { collection: collection.to_owned(), id: doc.id, fields: doc.fields };
        Self::written(self.submit(op).await?)
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, KeelError> {
        self.admit(collection, id)?;
        let op = Operation::Update { collection: collection.to_owned(), id: id.to_owned(), fields };
        Self::written(self.submit(op).await?)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), KeelError> {
        self.admit(collection, id)?;
        let op = Operation::Delete { collection: collection.to_owned(), id: id.to_owned() };
        self.submit(op).await?.into_result().map(|_| ())
    }

    pub async fn compare_and_swap(
        &self,
        collection: &str,
        request: CasRequest,
    ) -> Result<CasResult, KeelError> {
        self.admit(collection, &request.key)?;
        let op = Operation::Cas { collection: collection.to_owned(), request };
        self.submit(op).await?.into_cas_result()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Strong reads pass a read barrier, so a freshly elected leader does
    /// not serve state older than what the previous leader committed.
    async fn check_read(&self, consistency: ReadConsistency) -> Result<(), KeelError> {
        self.readiness.ensure_ready()?;
        if consistency == ReadConsistency::Strong {
            if !self.consensus.is_leader() {
                return Err(KeelError::LeaderRequired);
            }
            self.consensus.read_barrier(self.config.apply_timeout()).await?;
        }
        Ok(())
    }

    pub async fn get_with(
        &self,
        collection: &str,
        id: &str,
        consistency: ReadConsistency,
    ) -> Result<Document, KeelError> {
        self.check_read(consistency).await?;
        self.store.get(collection, id).await
    }

    /// Local read; may trail the latest committed write on a follower.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Document, KeelError> {
        self.get_with(collection, id, ReadConsistency::Local).await
    }

    pub async fn get_strong(&self, collection: &str, id: &str) -> Result<Document, KeelError> {
        self.get_with(collection, id, ReadConsistency::Strong).await
    }

    pub async fn list_with(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
        consistency: ReadConsistency,
    ) -> Result<Vec<Document>, KeelError> {
        self.check_read(consistency).await?;
        self.store.list(collection, limit, offset).await
    }

    pub async fn list(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, KeelError> {
        self.list_with(collection, limit, offset, ReadConsistency::Local).await
    }

    pub async fn list_strong(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, KeelError> {
        self.list_with(collection, limit, offset, ReadConsistency::Strong).await
    }

    pub async fn count_with(
        &self,
        collection: &str,
        consistency: ReadConsistency,
    ) -> Result<usize, KeelError> {
        self.check_read(consistency).await?;
        self.store.count(collection).await
    }

    pub async fn count(&self, collection: &str) -> Result<usize, KeelError> {
        self.count_with(collection, ReadConsistency::Local).await
    }

    pub async fn count_strong(&self, collection: &str) -> Result<usize, KeelError> {
        self.count_with(collection, ReadConsistency::Strong).await
    }

    // -----------------------------------------------------------------------
    // Health, info, shutdown
    // -----------------------------------------------------------------------

    pub async fn health(&self) -> Result<(), KeelError> {
        self.readiness.ensure_ready()?;
        self.store.health().await?;
        match self.consensus.role() {
            Role::Leader | Role::Follower => Ok(()),
            role => Err(KeelError::Unavailable(format!("consensus node in invalid role: {role}"))),
        }
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        let status = self.consensus.status();
        ClusterInfo {
            node_id: self.consensus.node_id(),
            role: status.role,
            is_leader: self.consensus.is_leader(),
            leader_address: self.consensus.leader_address(),
            readiness: self.readiness.state(),
            alive_members: self.membership.alive_member_count(),
            members: self.membership.members(),
            term: status.term,
            last_applied_index: status.last_applied_index,
        }
    }

    /// Leave the membership, stop consensus, close the store. Every step
    /// runs; the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), KeelError> {
        self.readiness.set(ReadinessState::Stopped);
        let mut first: Option<KeelError> = None;

        if let Err(e) = self.membership.leave(self.config.leave_timeout()).await {
            tracing::warn!(error = %e, "membership leave failed");
            first.get_or_insert(e);
        }
        if let Err(e) = self.consensus.shutdown().await {
            tracing::warn!(error = %e, "consensus shutdown failed");
            first.get_or_insert(e);
        }
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "store close failed");
            first.get_or_insert(e);
        }

        match first {
            Some(e) => Err(e),
            None => {
                tracing::info!(node_id = self.consensus.node_id(), "node shut down");
                Ok(())
            }
        }
    }
}
