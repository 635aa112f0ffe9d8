use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::time::Duration;

use keel_types::{KeelError, NodeId};
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberState::Alive => "alive",
            MemberState::Suspect => "suspect",
            MemberState::Dead => "dead",
        })
    }
}

/// One member as seen by the membership layer. This view is independent of
/// the consensus group: an alive member is not necessarily a voter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClusterMember {
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
    pub raft_address: String,
    pub state: MemberState,
}

impl ClusterMember {
    pub fn alive(
        node_id: NodeId,
        address: impl Into<String>,
        raft_address: impl Into<String>,
    ) -> Self {
        ClusterMember {
            node_id,
            name: format!("node-{node_id}"),
            address: address.into(),
            raft_address: raft_address.into(),
            state: MemberState::Alive,
        }
    }
}

/// Membership collaborator read by the distributed store. The store never
/// mutates member state itself.
pub trait Membership: Send + Sync + 'static {
    /// Join via `seeds`. An empty list means this is the first node.
    fn join(&self, seeds: &[String]) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn leave(&self, timeout: Duration) -> impl Future<Output = Result<(), KeelError>> + Send;

    fn members(&self) -> Vec<ClusterMember>;

    fn alive_member_count(&self) -> usize {
        self.members().iter().filter(|m| m.state == MemberState::Alive).count()
    }
}

// ---------------------------------------------------------------------------
// StaticMembership: fixed member list from configuration
// ---------------------------------------------------------------------------

/// Members come from configuration. The local member is alive between
/// `join` and `leave`; peer states are whatever was configured or last set
/// through [`StaticMembership::set_state`].
pub struct StaticMembership {
    local: ClusterMember,
    peers: RwLock<BTreeMap<NodeId, ClusterMember>>,
    joined: AtomicBool,
}

impl StaticMembership {
    pub fn new(local: ClusterMember, peers: impl IntoIterator<Item = ClusterMember>) -> Self {
        StaticMembership {
            local,
            peers: RwLock::new(peers.into_iter().map(|m| (m.node_id, m)).collect()),
            joined: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &ClusterMember {
        &self.local
    }

    /// Returns `false` if `node_id` is not a configured peer.
    pub fn set_state(&self, node_id: NodeId, state: MemberState) -> bool {
        match self.peers.write().get_mut(&node_id) {
            Some(member) => {
                if member.state != state {
                    tracing::info!(node_id, %state, "member state changed");
                }
                member.state = state;
                true
            }
            None => false,
        }
    }
}

impl Membership for StaticMembership {
    async fn join(&self, seeds: &[String]) -> Result<(), KeelError> {
        if seeds.is_empty() {
            tracing::info!(node_id = self.local.node_id, "no seeds, starting as first member");
        } else {
            let known: Vec<String> =
                self.peers.read().values().map(|m| m.address.clone()).collect();
            for seed in seeds.iter().filter(|s| !known.contains(s)) {
                tracing::warn!(%seed, "seed is not a configured peer");
            }
            tracing::info!(node_id = self.local.node_id, seeds = seeds.len(), "joined cluster");
        }
        self.joined.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn leave(&self, _timeout: Duration) -> Result<(), KeelError> {
        self.joined.store(false, Ordering::SeqCst);
        tracing::info!(node_id = self.local.node_id, "left cluster");
        Ok(())
    }

    fn members(&self) -> Vec<ClusterMember> {
        let mut local = self.local.clone();
        if !self.joined.load(Ordering::SeqCst) {
            local.state = MemberState::Dead;
        }
        std::iter::once(local).chain(self.peers.read().values().cloned()).collect()
    }
}
