use std::time::Duration;

pub const DEFAULT_WAIT_FOR_LEADER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Initialize the consensus group on start. Set on exactly one seed node
    /// of a brand-new cluster.
    pub bootstrap: bool,
    /// Membership addresses to join through. Empty on the first node.
    pub seeds: Vec<String>,
    /// Alive members required before waiting for a leader. `<= 1` skips the wait.
    pub min_cluster_size: usize,
    pub min_members_timeout_ms: u64,
    pub member_poll_interval_ms: u64,
    pub wait_for_leader_timeout_ms: u64,
    pub apply_timeout_ms: u64,
    pub leave_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            bootstrap: false,
            seeds: Vec::new(),
            min_cluster_size: 1,
            min_members_timeout_ms: DEFAULT_WAIT_FOR_LEADER_TIMEOUT.as_millis() as u64,
            member_poll_interval_ms: 500,
            wait_for_leader_timeout_ms: DEFAULT_WAIT_FOR_LEADER_TIMEOUT.as_millis() as u64,
            apply_timeout_ms: keel_consensus::DEFAULT_APPLY_TIMEOUT.as_millis() as u64,
            leave_timeout_ms: DEFAULT_LEAVE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DistributedConfig {
    pub fn min_members_timeout(&self) -> Duration {
        Duration::from_millis(self.min_members_timeout_ms)
    }

    pub fn member_poll_interval(&self) -> Duration {
        Duration::from_millis(self.member_poll_interval_ms)
    }

    pub fn wait_for_leader_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_leader_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}
