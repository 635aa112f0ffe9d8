use keel_types::{ApplyResponse, Document, KeelError, LogEntry, Operation};

use crate::keys::meta_key;
use crate::store::LocalStore;
use crate::types::{Partition, Snapshot, SnapshotContents, WriteOp};
use crate::{decode, encode};

/// Meta label of the consensus applied marker.
const APPLIED: &str = "applied";

fn applied_op(marker: Vec<u8>) -> Vec<WriteOp> {
    vec![WriteOp::Put { partition: Partition::Meta, key: meta_key(APPLIED), value: marker }]
}

/// Deterministic apply of replicated [`LogEntry`]s onto a [`LocalStore`].
///
/// The result of `apply` depends only on the store contents and the entry:
/// timestamps come from `entry.timestamp_ns`, never the clock. Each apply
/// also persists the caller's applied marker in the same batch as the
/// document write, so a restarted node resumes exactly after the last entry
/// it reflected.
///
/// Callers must apply entries one at a time, in log order.
pub struct StateMachine {
    store: LocalStore,
}

impl StateMachine {
    pub fn new(store: LocalStore) -> Self {
        StateMachine { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// The marker recorded by the last `apply`/`record_applied`/`restore`.
    pub async fn applied_marker(&self) -> Result<Option<Vec<u8>>, KeelError> {
        self.store.blocking(|s| s.read_meta(APPLIED)).await
    }

    /// Apply one entry and record `marker` as applied.
    ///
    /// `AlreadyExists`, `NotFound` and invalid names come back inside the
    /// response; a losing CAS is `success == false`. `Err` means a storage
    /// fault.
    pub async fn apply(
        &self,
        entry: LogEntry,
        marker: Vec<u8>,
    ) -> Result<ApplyResponse, KeelError> {
        let LogEntry { operation, timestamp_ns: ts, request_id } = entry;
        tracing::debug!(
            op = operation.kind(),
            collection = operation.collection(),
            %request_id,
            "apply"
        );
        self.store
            .blocking(move |s| {
                let extra = applied_op(marker);
                let outcome: Result<ApplyResponse, KeelError> = match operation {
                    Operation::Insert { collection, id, fields } => s
                        .insert(&collection, Document::new(id, fields), ts, extra)
                        .map(|d| ApplyResponse::written(Some(d))),
                    Operation::Update { collection, id, fields } => s
                        .update(&collection, &id, fields, ts, extra)
                        .map(|d| ApplyResponse::written(Some(d))),
                    Operation::Delete { collection, id } => {
                        s.delete(&collection, &id, extra).map(|()| ApplyResponse::written(None))
                    }
                    Operation::Cas { collection, request } => {
                        s.compare_and_swap(&collection, request, ts, extra).map(
                            |(success, document)| ApplyResponse { success, document, error: None },
                        )
                    }
                };
                match outcome {
                    Ok(resp) => Ok(resp),
                    Err(e) => match e.to_apply_error() {
                        Some(domain) => Ok(ApplyResponse::rejected(domain)),
                        None => Err(e),
                    },
                }
            })
            .await
    }

    /// Record `marker` for an entry that carries no document operation.
    pub async fn record_applied(&self, marker: Vec<u8>) -> Result<(), KeelError> {
        self.store.blocking(move |s| s.write_extra(applied_op(marker))).await
    }

    /// Serialize every document of every collection plus the applied marker.
    pub async fn snapshot(&self) -> Result<Snapshot, KeelError> {
        self.store
            .blocking(|s| {
                let (documents, applied) = s.export(APPLIED)?;
                let data = encode(&SnapshotContents { documents, applied: applied.clone() })?;
                Ok(Snapshot { applied, data })
            })
            .await
    }

    /// Replace the store contents with a snapshot built by [`Self::snapshot`]
    /// on any replica. Returns the applied marker it carried.
    pub async fn restore(&self, data: &[u8]) -> Result<Option<Vec<u8>>, KeelError> {
        let contents: SnapshotContents = decode(data)?;
        let count = contents.documents.len();
        let applied = contents.applied.clone();
        self.store
            .blocking(move |s| {
                let extra = match contents.applied {
                    Some(marker) => applied_op(marker),
                    None => vec![WriteOp::Delete {
                        partition: Partition::Meta,
                        key: meta_key(APPLIED),
                    }],
                };
                s.replace_all(contents.documents, extra)
            })
            .await?;
        tracing::info!(documents = count, "state machine restored from snapshot");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use keel_types::{fields, ApplyError, CasRequest};

    fn sm() -> StateMachine {
        StateMachine::new(LocalStore::in_memory(CacheConfig::default()))
    }

    fn entry(operation: Operation, ts: i64) -> LogEntry {
        LogEntry { operation, timestamp_ns: ts, request_id: format!("req-{ts}") }
    }

    fn marker(i: u64) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn workload() -> Vec<LogEntry> {
        vec![
            entry(
                Operation::Insert {
                    collection: "processes".into(),
                    id: "p1".into(),
                    fields: fields! { "state" => "waiting" },
                },
                100,
            ),
            entry(
                Operation::Insert {
                    collection: "executors".into(),
                    id: "e1".into(),
                    fields: fields! { "alive" => true },
                },
                101,
            ),
            entry(
                Operation::Cas {
                    collection: "processes".into(),
                    request: CasRequest {
                        key: "p1".into(),
                        expected: Some(fields! { "state" => "waiting" }),
                        value: fields! { "state" => "running", "executor" => "e1" },
                    },
                },
                102,
            ),
            // Duplicate insert: rejected, still applied.
            entry(
                Operation::Insert {
                    collection: "processes".into(),
                    id: "p1".into(),
                    fields: fields! {},
                },
                103,
            ),
            entry(
                Operation::Update {
                    collection: "executors".into(),
                    id: "e1".into(),
                    fields: fields! { "load" => 0.5 },
                },
                104,
            ),
            entry(Operation::Delete { collection: "executors".into(), id: "e1".into() }, 105),
        ]
    }

    #[tokio::test]
    async fn replay_is_byte_identical() {
        let a = sm();
        let b = sm();
        for (i, e) in workload().into_iter().enumerate() {
            a.apply(e.clone(), marker(i as u64)).await.unwrap();
            b.apply(e, marker(i as u64)).await.unwrap();
        }
        let snap_a = a.snapshot().await.unwrap();
        let snap_b = b.snapshot().await.unwrap();
        assert_eq!(snap_a.data, snap_b.data);
        assert_eq!(snap_a.applied, Some(marker(5)));
    }

    #[tokio::test]
    async fn domain_failures_are_results() {
        let m = sm();
        let resp = m
            .apply(
                entry(Operation::Delete { collection: "c".into(), id: "gone".into() }, 1),
                marker(1),
            )
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(
            resp.error,
            Some(ApplyError::NotFound { collection: "c".into(), id: "gone".into() })
        );
        // The marker advances even for a rejected entry.
        assert_eq!(m.applied_marker().await.unwrap(), Some(marker(1)));
    }

    #[tokio::test]
    async fn losing_cas_reports_current_state() {
        let m = sm();
        for (i, e) in workload().into_iter().take(3).enumerate() {
            m.apply(e, marker(i as u64)).await.unwrap();
        }
        let resp = m
            .apply(
                entry(
                    Operation::Cas {
                        collection: "processes".into(),
                        request: CasRequest {
                            key: "p1".into(),
                            expected: Some(fields! { "state" => "waiting" }),
                            value: fields! { "state" => "running", "executor" => "e2" },
                        },
                    },
                    200,
                ),
                marker(3),
            )
            .await
            .unwrap();
        assert!(!resp.success);
        assert!(resp.error.is_none());
        assert_eq!(resp.version(), 2);
        assert_eq!(resp.value(), Some(&fields! { "state" => "running", "executor" => "e1" }));
    }

    #[tokio::test]
    async fn timestamps_come_from_entry() {
        let m = sm();
        let resp = m.apply(workload().remove(0), marker(0)).await.unwrap();
        let doc = resp.document.unwrap();
        assert_eq!(doc.created_at_ns, 100);
        assert_eq!(doc.modified_at_ns, 100);
    }

    #[tokio::test]
    async fn snapshot_restore_rebuilds_state() {
        let source = sm();
        for (i, e) in workload().into_iter().enumerate() {
            source.apply(e, marker(i as u64)).await.unwrap();
        }
        let snap = source.snapshot().await.unwrap();

        let target = sm();
        target
            .apply(
                entry(
                    Operation::Insert {
                        collection: "stale".into(),
                        id: "x".into(),
                        fields: fields! {},
                    },
                    1,
                ),
                marker(0),
            )
            .await
            .unwrap();
        let applied = target.restore(&snap.data).await.unwrap();
        assert_eq!(applied, Some(marker(5)));

        assert!(target.store().get("stale", "x").await.is_err());
        let p1 = target.store().get("processes", "p1").await.unwrap();
        assert_eq!(p1.version, 2);
        assert_eq!(target.snapshot().await.unwrap().data, snap.data);
    }

    #[tokio::test]
    async fn fjall_backed_apply_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let m = StateMachine::new(LocalStore::open(dir.path(), CacheConfig::default()).unwrap());
        for (i, e) in workload().into_iter().enumerate() {
            m.apply(e, marker(i as u64)).await.unwrap();
        }
        assert_eq!(m.applied_marker().await.unwrap(), Some(marker(5)));
        assert_eq!(m.store().count("processes").await.unwrap(), 1);

        let mem = sm();
        for (i, e) in workload().into_iter().enumerate() {
            mem.apply(e, marker(i as u64)).await.unwrap();
        }
        assert_eq!(m.snapshot().await.unwrap().data, mem.snapshot().await.unwrap().data);
    }
}
