pub mod config;
pub mod membership;
pub mod readiness;
pub mod store;

pub use config::DistributedConfig;
pub use membership::{ClusterMember, MemberState, Membership, StaticMembership};
pub use readiness::{Readiness, ReadinessState};
pub use store::{ClusterInfo, DistributedStore};
