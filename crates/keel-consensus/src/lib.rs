pub mod engine;
pub mod log_store;
pub mod router;
pub mod state_machine;
pub mod types;

pub use engine::{
    ConsensusConfig, ConsensusEngine, ConsensusStatus, RaftEngine, DEFAULT_APPLY_TIMEOUT,
};
pub use log_store::LogStoreAdapter;
pub use router::Router;
pub use state_machine::KeelStateMachine;
pub use types::{KeelNode, KeelRaft, TypeConfig};
