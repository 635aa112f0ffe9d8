//! [`RaftStateMachine`] over the deterministic [`keel_storage::StateMachine`].

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_storage::StateMachine;
use keel_types::{ApplyResponse, KeelError, NodeId};
use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError};
use tokio::sync::RwLock;

use crate::types::{
    AppliedState, Entry, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership, TypeConfig,
};

fn read_sm(e: impl std::error::Error + 'static) -> StorageIOError<NodeId> {
    StorageIOError::read_state_machine(&e)
}

fn write_sm(e: impl std::error::Error + 'static) -> StorageIOError<NodeId> {
    StorageIOError::write_state_machine(&e)
}

struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// Each applied entry persists an [`AppliedState`] marker in the same batch
/// as its document write, so the applied position survives restarts.
pub struct KeelStateMachine {
    sm: Arc<StateMachine>,
    membership: parking_lot::RwLock<StoredMembership>,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    snapshot_idx: AtomicU64,
}

impl KeelStateMachine {
    /// Load the last applied membership from the store.
    pub async fn open(sm: Arc<StateMachine>) -> Result<Arc<Self>, KeelError> {
        let applied = read_applied(&sm).await?;
        Ok(Arc::new(KeelStateMachine {
            sm,
            membership: parking_lot::RwLock::new(applied.membership),
            current_snapshot: RwLock::new(None),
            snapshot_idx: AtomicU64::new(0),
        }))
    }

    pub fn inner(&self) -> &Arc<StateMachine> {
        &self.sm
    }

    fn marker(&self, last_applied: LogId) -> Result<Vec<u8>, StorageError> {
        let state = AppliedState {
            last_applied: Some(last_applied),
            membership: self.membership.read().clone(),
        };
        serde_json::to_vec(&state).map_err(|e| write_sm(e).into())
    }
}

async fn read_applied(sm: &StateMachine) -> Result<AppliedState, KeelError> {
    match sm.applied_marker().await? {
        Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| KeelError::Io(e.to_string())),
        None => Ok(AppliedState::default()),
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<KeelStateMachine> {
    async fn build_snapshot(&mut self) -> Result<Snapshot, StorageError> {
        let snapshot = self.sm.snapshot().await.map_err(read_sm)?;
        let applied: AppliedState = match &snapshot.applied {
            Some(bytes) => serde_json::from_slice(bytes).map_err(read_sm)?,
            None => AppliedState::default(),
        };

        let idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match applied.last_applied {
            Some(last) => format!("{}-{}-{}", last.leader_id, last.index, idx),
            None => format!("--{idx}"),
        };
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership,
            snapshot_id,
        };
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = snapshot.data.len(),
            "built snapshot"
        );

        let stored = StoredSnapshot { meta: meta.clone(), data: snapshot.data.clone() };
        *self.current_snapshot.write().await = Some(stored);
        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(snapshot.data)) })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<KeelStateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), StorageError> {
        let applied = read_applied(&self.sm).await.map_err(read_sm)?;
        *self.membership.write() = applied.membership.clone();
        Ok((applied.last_applied, applied.membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResponse>, StorageError>
    where
        I: IntoIterator<Item = Entry> + Send,
    {
        let entries: Vec<Entry> = entries.into_iter().collect();
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            let log_id = entry.log_id;
            tracing::trace!(%log_id, "applying to state machine");
            match entry.payload {
                EntryPayload::Blank => {
                    let marker = self.marker(log_id)?;
                    self.sm.record_applied(marker).await.map_err(write_sm)?;
                    responses.push(ApplyResponse::empty());
                }
                EntryPayload::Normal(cmd) => {
                    let marker = self.marker(log_id)?;
                    let resp = self.sm.apply(cmd, marker).await.map_err(write_sm)?;
                    responses.push(resp);
                }
                EntryPayload::Membership(membership) => {
                    *self.membership.write() = StoredMembership::new(Some(log_id), membership);
                    let marker = self.marker(log_id)?;
                    self.sm.record_applied(marker).await.map_err(write_sm)?;
                    responses.push(ApplyResponse::empty());
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), StorageError> {
        let data = snapshot.into_inner();
        tracing::info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "installing snapshot");

        self.sm
            .restore(&data)
            .await
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        // The marker inside the payload reflects the sender's apply; the
        // meta is authoritative.
        let applied = AppliedState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        let marker = serde_json::to_vec(&applied).map_err(write_sm)?;
        self.sm.record_applied(marker).await.map_err(write_sm)?;
        *self.membership.write() = meta.last_membership.clone();

        *self.current_snapshot.write().await = Some(StoredSnapshot { meta: meta.clone(), data });
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot>, StorageError> {
        match &*self.current_snapshot.read().await {
            Some(s) => Ok(Some(Snapshot {
                meta: s.meta.clone(),
                snapshot: Box::new(Cursor::new(s.data.clone())),
            })),
            None => Ok(None),
        }
    }
}
