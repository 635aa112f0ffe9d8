pub mod cache;
pub mod fjall;
pub mod keys;
pub mod mem;
pub mod state_machine;
pub mod store;
pub mod traits;
pub mod types;

use keel_types::KeelError;

pub use cache::{CacheConfig, CacheStats, DocumentCache};
pub use crate::fjall::{FjallEngine, FjallLogStorage};
pub use mem::{MemEngine, MemLogStorage};
pub use state_machine::StateMachine;
pub use store::LocalStore;
pub use traits::{LogStorage, StorageEngine};
pub use types::{LogRecord, Partition, Snapshot, Vote, WriteOp};

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, KeelError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| KeelError::Io(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, KeelError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| KeelError::Io(e.to_string()))
}
