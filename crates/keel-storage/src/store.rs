use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use keel_types::{fields_eq, CasRequest, CasResult, Document, Fields, KeelError};

use crate::cache::{CacheConfig, CacheStats, DocumentCache};
use crate::fjall::FjallEngine;
use crate::keys::{collection_prefix, document_key, validate, validate_collection};
use crate::mem::MemEngine;
use crate::traits::StorageEngine;
use crate::types::{Partition, WriteOp};
use crate::{decode, encode};

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Versioned document store for one node: a [`StorageEngine`] fronted by a
/// [`DocumentCache`].
///
/// Every read-check-write sequence (insert, update, delete, CAS, restore)
/// runs under one per-store mutex, so two mutations of the same key on this
/// node never interleave. Cache hits do not take the mutex; a miss fills
/// the cache under it.
///
/// Mutations come in two forms: the plain one stamps the wall clock, the
/// `*_at` one takes the timestamp from the caller. The replicated apply
/// path only uses the latter.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    engine: Arc<dyn StorageEngine>,
    cache: DocumentCache,
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(engine: Arc<dyn StorageEngine>, cache: CacheConfig) -> Self {
        LocalStore {
            inner: Arc::new(StoreInner {
                engine,
                cache: DocumentCache::new(cache),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Durable store backed by fjall at `path`.
    pub fn open(path: &Path, cache: CacheConfig) -> Result<Self, KeelError> {
        Ok(Self::new(Arc::new(FjallEngine::open(path)?), cache))
    }

    pub fn in_memory(cache: CacheConfig) -> Self {
        Self::new(Arc::new(MemEngine::new()), cache)
    }

    /// Run `f` against the store on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, KeelError>
    where
        F: FnOnce(&StoreInner) -> Result<T, KeelError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| KeelError::Io(e.to_string()))?
    }

    pub async fn insert(&self, collection: &str, doc: Document) -> Result<Document, KeelError> {
        self.insert_at(collection, doc, now_ns()).await
    }

    /// Fails with `AlreadyExists` if `(collection, doc.id)` is present.
    /// The stored document has version 1 and both timestamps set to `now_ns`.
    pub async fn insert_at(
        &self,
        collection: &str,
        doc: Document,
        now_ns: i64,
    ) -> Result<Document, KeelError> {
        let collection = collection.to_owned();
        self.blocking(move |s| s.insert(&collection, doc, now_ns, Vec::new())).await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Document, KeelError> {
        let (collection, id) = (collection.to_owned(), id.to_owned());
        self.blocking(move |s| s.get(&collection, &id)).await
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Fields,
    ) -> Result<Document, KeelError> {
        self.update_at(collection, id, partial, now_ns()).await
    }

    /// Merge `partial` into the stored fields; keys not named in `partial`
    /// are kept. Returns the full updated document.
    pub async fn update_at(
        &self,
        collection: &str,
        id: &str,
        partial: Fields,
        now_ns: i64,
    ) -> Result<Document, KeelError> {
        let (collection, id) = (collection.to_owned(), id.to_owned());
        self.blocking(move |s| s.update(&collection, &id, partial, now_ns, Vec::new())).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), KeelError> {
        let (collection, id) = (collection.to_owned(), id.to_owned());
        self.blocking(move |s| s.delete(&collection, &id, Vec::new())).await
    }

    /// Documents of `collection` in key order, skipping `offset` and
    /// returning at most `limit` (`0` = no limit).
    pub async fn list(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, KeelError> {
        let collection = collection.to_owned();
        self.blocking(move |s| s.list(&collection, limit, offset)).await
    }

    pub async fn count(&self, collection: &str) -> Result<usize, KeelError> {
        let collection = collection.to_owned();
        self.blocking(move |s| {
            validate_collection(&collection)?;
            s.engine.count_prefix(Partition::Documents, collection_prefix(&collection).as_bytes())
        })
        .await
    }

    pub async fn compare_and_swap(
        &self,
        collection: &str,
        request: CasRequest,
    ) -> Result<CasResult, KeelError> {
        self.compare_and_swap_at(collection, request, now_ns()).await
    }

    /// A comparison mismatch is `Ok` with `success == false` and the current
    /// value/version; only storage faults are errors.
    pub async fn compare_and_swap_at(
        &self,
        collection: &str,
        request: CasRequest,
        now_ns: i64,
    ) -> Result<CasResult, KeelError> {
        let collection = collection.to_owned();
        let (success, doc) = self
            .blocking(move |s| s.compare_and_swap(&collection, request, now_ns, Vec::new()))
            .await?;
        Ok(CasResult {
            success,
            version: doc.as_ref().map(|d| d.version).unwrap_or(0),
            current_value: doc.map(|d| d.fields),
        })
    }

    /// No-op read against the engine; `Unavailable` once closed.
    pub async fn health(&self) -> Result<(), KeelError> {
        self.blocking(|s| s.engine.health()).await
    }

    pub async fn close(&self) -> Result<(), KeelError> {
        self.blocking(|s| {
            s.engine.close()?;
            s.cache.clear();
            Ok(())
        })
        .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

impl StoreInner {
    fn read_current(&self, key: &str) -> Result<Option<Document>, KeelError> {
        self.engine
            .get(Partition::Documents, key.as_bytes())?
            .map(|b| decode::<Document>(&b))
            .transpose()
    }

    /// Write `doc` under `key` together with `extra` in one batch.
    fn persist(&self, key: &str, doc: &Document, extra: Vec<WriteOp>) -> Result<(), KeelError> {
        let mut ops = Vec::with_capacity(1 + extra.len());
        ops.push(WriteOp::Put {
            partition: Partition::Documents,
            key: key.as_bytes().to_vec(),
            value: encode(doc)?,
        });
        ops.extend(extra);
        self.engine.write_batch(ops)
    }

    /// `extra` is committed even when the operation is rejected.
    fn reject<T>(&self, extra: Vec<WriteOp>, err: KeelError) -> Result<T, KeelError> {
        if !extra.is_empty() {
            self.engine.write_batch(extra)?;
        }
        Err(err)
    }

    pub(crate) fn write_extra(&self, extra: Vec<WriteOp>) -> Result<(), KeelError> {
        let _guard = self.write_lock.lock();
        self.engine.write_batch(extra)
    }

    pub(crate) fn read_meta(&self, label: &str) -> Result<Option<Vec<u8>>, KeelError> {
        self.engine.get(Partition::Meta, label.as_bytes())
    }

    pub(crate) fn insert(
        &self,
        collection: &str,
        doc: Document,
        now_ns: i64,
        extra: Vec<WriteOp>,
    ) -> Result<Document, KeelError> {
        if let Err(e) = validate(collection, &doc.id) {
            return self.reject(extra, e);
        }
        let key = document_key(collection, &doc.id);
        let _guard = self.write_lock.lock();
        if self.engine.get(Partition::Documents, key.as_bytes())?.is_some() {
            let err = KeelError::AlreadyExists { collection: collection.into(), id: doc.id };
            return self.reject(extra, err);
        }
        let stored = Document {
            id: doc.id,
            fields: doc.fields,
            version: 1,
            created_at_ns: now_ns,
            modified_at_ns: now_ns,
        };
        self.persist(&key, &stored, extra)?;
        self.cache.put(key, stored.clone());
        Ok(stored)
    }

    pub(crate) fn get(&self, collection: &str, id: &str) -> Result<Document, KeelError> {
        validate(collection, id)?;
        let key = document_key(collection, id);
        if let Some(doc) = self.cache.get(&key) {
            return Ok(doc);
        }
        // A miss fills the cache under the write mutex so an older engine
        // read cannot overwrite an entry refreshed by a concurrent write.
        let _guard = self.write_lock.lock();
        if let Some(doc) = self.cache.peek(&key) {
            return Ok(doc);
        }
        match self.read_current(&key)? {
            Some(doc) => {
                self.cache.put(key, doc.clone());
                Ok(doc)
            }
            None => Err(KeelError::NotFound { collection: collection.into(), id: id.into() }),
        }
    }

    pub(crate) fn update(
        &self,
        collection: &str,
        id: &str,
        partial: Fields,
        now_ns: i64,
        extra: Vec<WriteOp>,
    ) -> Result<Document, KeelError> {
        if let Err(e) = validate(collection, id) {
            return self.reject(extra, e);
        }
        let key = document_key(collection, id);
        let _guard = self.write_lock.lock();
        let Some(mut doc) = self.read_current(&key)? else {
            let err = KeelError::NotFound { collection: collection.into(), id: id.into() };
            return self.reject(extra, err);
        };
        doc.fields.extend(partial);
        doc.version += 1;
        doc.modified_at_ns = now_ns;
        self.persist(&key, &doc, extra)?;
        self.cache.put(key, doc.clone());
        Ok(doc)
    }

    pub(crate) fn delete(
        &self,
        collection: &str,
        id: &str,
        extra: Vec<WriteOp>,
    ) -> Result<(), KeelError> {
        if let Err(e) = validate(collection, id) {
            return self.reject(extra, e);
        }
        let key = document_key(collection, id);
        let _guard = self.write_lock.lock();
        if self.engine.get(Partition::Documents, key.as_bytes())?.is_none() {
            let err = KeelError::NotFound { collection: collection.into(), id: id.into() };
            return self.reject(extra, err);
        }
        let mut ops = Vec::with_capacity(1 + extra.len());
        ops.push(WriteOp::Delete { partition: Partition::Documents, key: key.as_bytes().to_vec() });
        ops.extend(extra);
        self.engine.write_batch(ops)?;
        self.cache.invalidate(&key);
        Ok(())
    }

    pub(crate) fn list(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, KeelError> {
        validate_collection(collection)?;
        let prefix = collection_prefix(collection);
        self.engine
            .scan_prefix(Partition::Documents, prefix.as_bytes(), offset, limit)?
            .into_iter()
            .map(|(_, v)| decode::<Document>(&v))
            .collect()
    }

    /// Returns `(success, document)`: the installed document on success,
    /// the untouched current document (if any) on mismatch.
    pub(crate) fn compare_and_swap(
        &self,
        collection: &str,
        request: CasRequest,
        now_ns: i64,
        extra: Vec<WriteOp>,
    ) -> Result<(bool, Option<Document>), KeelError> {
        if let Err(e) = validate(collection, &request.key) {
            return self.reject(extra, e);
        }
        let key = document_key(collection, &request.key);
        let _guard = self.write_lock.lock();
        let current = self.read_current(&key)?;
        let matches = match (&current, &request.expected) {
            (None, None) => true,
            (Some(doc), Some(expected)) => fields_eq(&doc.fields, expected),
            _ => false,
        };
        if !matches {
            if !extra.is_empty() {
                self.engine.write_batch(extra)?;
            }
            return Ok((false, current));
        }
        let next = match current {
            Some(doc) => Document {
                id: doc.id,
                fields: request.value,
                version: doc.version + 1,
                created_at_ns: doc.created_at_ns,
                modified_at_ns: now_ns,
            },
            None => Document {
                id: request.key,
                fields: request.value,
                version: 1,
                created_at_ns: now_ns,
                modified_at_ns: now_ns,
            },
        };
        self.persist(&key, &next, extra)?;
        self.cache.put(key, next.clone());
        Ok((true, Some(next)))
    }

    /// Every document of every collection, in key order, taken under the
    /// write mutex together with the meta `label`.
    pub(crate) fn export(
        &self,
        label: &str,
    ) -> Result<(Vec<(String, Document)>, Option<Vec<u8>>), KeelError> {
        let _guard = self.write_lock.lock();
        let documents = self
            .engine
            .scan_prefix(Partition::Documents, b"", 0, 0)?
            .into_iter()
            .map(|(k, v)| {
                let key = String::from_utf8(k).map_err(|e| KeelError::Io(e.to_string()))?;
                Ok((key, decode::<Document>(&v)?))
            })
            .collect::<Result<Vec<_>, KeelError>>()?;
        let meta = self.engine.get(Partition::Meta, label.as_bytes())?;
        Ok((documents, meta))
    }

    /// Replace every document with `documents` and apply `extra`, in one
    /// batch. The cache is dropped afterwards.
    pub(crate) fn replace_all(
        &self,
        documents: Vec<(String, Document)>,
        extra: Vec<WriteOp>,
    ) -> Result<(), KeelError> {
        let _guard = self.write_lock.lock();
        let existing = self.engine.scan_prefix(Partition::Documents, b"", 0, 0)?;
        let mut ops = Vec::with_capacity(existing.len() + documents.len() + extra.len());
        for (k, _) in existing {
            ops.push(WriteOp::Delete { partition: Partition::Documents, key: k });
        }
        for (key, doc) in &documents {
            ops.push(WriteOp::Put {
                partition: Partition::Documents,
                key: key.as_bytes().to_vec(),
                value: encode(doc)?,
            });
        }
        ops.extend(extra);
        self.engine.write_batch(ops)?;
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{fields, Value};

    fn store() -> LocalStore {
        LocalStore::in_memory(CacheConfig::default())
    }

    fn doc(id: &str, fields: Fields) -> Document {
        Document::new(id, fields)
    }

    #[tokio::test]
    async fn insert_sets_version_and_timestamps() {
        let s = store();
        let stored = s
            .insert_at("processes", doc("p1", fields! { "state" => "waiting" }), 42)
            .await
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.created_at_ns, 42);
        assert_eq!(stored.modified_at_ns, 42);
        assert_eq!(s.get("processes", "p1").await.unwrap(), stored);
    }

    #[tokio::test]
    async fn insert_is_exclusive() {
        let s = store();
        s.insert("processes", doc("p1", fields! { "state" => "waiting" })).await.unwrap();
        let err = s
            .insert("processes", doc("p1", fields! { "state" => "other" }))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));

        let current = s.get("processes", "p1").await.unwrap();
        assert_eq!(current.fields, fields! { "state" => "waiting" });
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let s = store();
        let err = s.get("processes", "nope").await.unwrap_err();
        assert_eq!(err, KeelError::NotFound { collection: "processes".into(), id: "nope".into() });
    }

    #[tokio::test]
    async fn update_merges_and_bumps_version() {
        let s = store();
        s.insert_at("c", doc("d", fields! { "a" => 0, "keep" => "yes" }), 1).await.unwrap();
        let updated = s.update_at("c", "d", fields! { "a" => 1, "new" => true }, 5).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at_ns, 1);
        assert_eq!(updated.modified_at_ns, 5);

        let read = s.get("c", "d").await.unwrap();
        assert_eq!(read.fields["a"], Value::Int(1));
        assert_eq!(read.fields["keep"], Value::from("yes"));
        assert_eq!(read.fields["new"], Value::Bool(true));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let s = store();
        let err = s.update("c", "d", fields! { "a" => 1 }).await.unwrap_err();
        assert!(matches!(err, KeelError::NotFound { .. }));
    }

    #[tokio::test]
    async fn version_counts_mutations() {
        let s = store();
        s.insert("c", doc("d", fields! { "n" => 0 })).await.unwrap();
        for n in 1..10 {
            s.update("c", "d", fields! { "n" => n }).await.unwrap();
        }
        let cas = s
            .compare_and_swap(
                "c",
                CasRequest {
                    key: "d".into(),
                    expected: Some(fields! { "n" => 9 }),
                    value: fields! { "n" => 10 },
                },
            )
            .await
            .unwrap();
        assert!(cas.success);
        // 1 insert + 9 updates + 1 CAS
        assert_eq!(s.get("c", "d").await.unwrap().version, 11);
    }

    #[tokio::test]
    async fn delete_then_missing() {
        let s = store();
        s.insert("c", doc("d", fields! {})).await.unwrap();
        s.get("c", "d").await.unwrap(); // populate cache
        s.delete("c", "d").await.unwrap();
        assert!(matches!(s.get("c", "d").await, Err(KeelError::NotFound { .. })));
        assert!(matches!(s.delete("c", "d").await, Err(KeelError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_offset_limit_and_count() {
        let s = store();
        for i in 0..5 {
            s.insert("jobs", doc(&format!("j{i}"), fields! { "i" => i })).await.unwrap();
        }
        s.insert("jobsx", doc("other", fields! {})).await.unwrap();

        let all = s.list("jobs", 0, 0).await.unwrap();
        assert_eq!(all.len(), 5);
        let ids: Vec<_> = s.list("jobs", 2, 1).await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["j1", "j2"]);
        assert!(s.list("jobs", 10, 10).await.unwrap().is_empty());
        assert_eq!(s.count("jobs").await.unwrap(), 5);
        assert_eq!(s.count("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cas_absent_expected_creates() {
        let s = store();
        let req = CasRequest { key: "k".into(), expected: None, value: fields! { "v" => 1 } };
        let res = s.compare_and_swap("c", req.clone()).await.unwrap();
        assert!(res.success);
        assert_eq!(res.version, 1);

        // Second "must not exist" attempt loses and reports current state.
        let res = s.compare_and_swap("c", req).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.version, 1);
        assert_eq!(res.current_value, Some(fields! { "v" => 1 }));
    }

    #[tokio::test]
    async fn cas_expected_on_missing_fails_without_creating() {
        let s = store();
        let req = CasRequest {
            key: "k".into(),
            expected: Some(fields! { "v" => 1 }),
            value: fields! { "v" => 2 },
        };
        let res = s.compare_and_swap("c", req).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.version, 0);
        assert!(res.current_value.is_none());
        assert!(matches!(s.get("c", "k").await, Err(KeelError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cas_compares_numbers_canonically() {
        let s = store();
        s.insert("c", doc("k", fields! { "n" => 1 })).await.unwrap();
        let res = s
            .compare_and_swap(
                "c",
                CasRequest {
                    key: "k".into(),
                    expected: Some(fields! { "n" => 1.0 }),
                    value: fields! { "n" => 2 },
                },
            )
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.version, 2);
    }

    #[tokio::test]
    async fn cas_preserves_created_timestamp() {
        let s = store();
        s.insert_at("c", doc("k", fields! { "s" => "a" }), 10).await.unwrap();
        s.compare_and_swap_at(
            "c",
            CasRequest {
                key: "k".into(),
                expected: Some(fields! { "s" => "a" }),
                value: fields! { "s" => "b" },
            },
            20,
        )
        .await
        .unwrap();
        let d = s.get("c", "k").await.unwrap();
        assert_eq!(d.created_at_ns, 10);
        assert_eq!(d.modified_at_ns, 20);
    }

    #[tokio::test]
    async fn process_assignment_scenario() {
        let s = store();
        s.insert("processes", doc("p1", fields! { "state" => "waiting" })).await.unwrap();

        let assign = |executor: &str| CasRequest {
            key: "p1".into(),
            expected: Some(fields! { "state" => "waiting" }),
            value: fields! { "state" => "running", "executor" => executor },
        };

        let first = s.compare_and_swap("processes", assign("e1")).await.unwrap();
        assert!(first.success);
        assert_eq!(first.version, 2);

        let second = s.compare_and_swap("processes", assign("e2")).await.unwrap();
        assert!(!second.success);
        assert_eq!(
            second.current_value,
            Some(fields! { "state" => "running", "executor" => "e1" })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_single_winner() {
        use rand::Rng;

        let s = store();
        s.insert("processes", doc("p1", fields! { "state" => "waiting" })).await.unwrap();

        const K: usize = 32;
        let mut handles = Vec::with_capacity(K);
        for i in 0..K {
            let s = s.clone();
            let jitter = rand::thread_rng().gen_range(0..3u64);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                s.compare_and_swap(
                    "processes",
                    CasRequest {
                        key: "p1".into(),
                        expected: Some(fields! { "state" => "waiting" }),
                        value: fields! { "state" => "running", "executor" => format!("e{i}") },
                    },
                )
                .await
                .unwrap()
            }));
        }

        let mut wins = 0;
        for h in handles {
            if h.await.unwrap().success {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(s.get("processes", "p1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn reads_are_served_from_cache() {
        let s = store();
        s.insert("c", doc("d", fields! {})).await.unwrap();
        s.get("c", "d").await.unwrap();
        s.get("c", "d").await.unwrap();
        assert!(s.cache_stats().hits >= 2);
    }

    /// Sleeps inside the first document read after `arm`.
    struct SlowReads {
        inner: MemEngine,
        armed: std::sync::atomic::AtomicBool,
    }

    impl SlowReads {
        fn arm(&self) {
            self.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl StorageEngine for SlowReads {
        fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Vec<u8>>, KeelError> {
            let value = self.inner.get(partition, key)?;
            if partition == Partition::Documents
                && self.armed.swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            Ok(value)
        }

        fn scan_prefix(
            &self,
            partition: Partition,
            prefix: &[u8],
            offset: usize,
            limit: usize,
        ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KeelError> {
            self.inner.scan_prefix(partition, prefix, offset, limit)
        }

        fn count_prefix(&self, partition: Partition, prefix: &[u8]) -> Result<usize, KeelError> {
            self.inner.count_prefix(partition, prefix)
        }

        fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), KeelError> {
            self.inner.write_batch(ops)
        }

        fn health(&self) -> Result<(), KeelError> {
            self.inner.health()
        }

        fn close(&self) -> Result<(), KeelError> {
            self.inner.close()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_cache_fill_does_not_hide_newer_write() {
        let engine =
            Arc::new(SlowReads { inner: MemEngine::new(), armed: Default::default() });
        let s = LocalStore::new(engine.clone(), CacheConfig::default());
        s.insert("processes", doc("p1", fields! { "state" => "waiting" })).await.unwrap();
        s.inner.cache.clear();
        engine.arm();

        let reader = {
            let s = s.clone();
            tokio::spawn(async move { s.get("processes", "p1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let cas = s
            .compare_and_swap(
                "processes",
                CasRequest {
                    key: "p1".into(),
                    expected: Some(fields! { "state" => "waiting" }),
                    value: fields! { "state" => "running" },
                },
            )
            .await
            .unwrap();
        assert!(cas.success);
        assert_eq!(reader.await.unwrap().unwrap().version, 1);

        let after = s.get("processes", "p1").await.unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.fields, fields! { "state" => "running" });
    }

    #[tokio::test]
    async fn uncached_store_reads_through() {
        let s = LocalStore::in_memory(CacheConfig { capacity: 0 });
        s.insert("c", doc("d", fields! { "x" => 1 })).await.unwrap();
        assert_eq!(s.get("c", "d").await.unwrap().fields, fields! { "x" => 1 });
        assert_eq!(s.cache_stats().hits, 0);
    }

    #[tokio::test]
    async fn invalid_names_rejected() {
        let s = store();
        let err = s.insert("bad:name", doc("d", fields! {})).await.unwrap_err();
        assert!(matches!(err, KeelError::InvalidArgument(_)));
        assert!(matches!(s.list("", 0, 0).await, Err(KeelError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn closed_store_is_unhealthy() {
        let s = store();
        s.health().await.unwrap();
        s.close().await.unwrap();
        assert!(matches!(s.health().await, Err(KeelError::Unavailable(_))));
        assert!(s.insert("c", doc("d", fields! {})).await.is_err());
    }

    #[tokio::test]
    async fn fjall_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = LocalStore::open(dir.path(), CacheConfig::default()).unwrap();
        s.insert("processes", doc("p1", fields! { "state" => "waiting" })).await.unwrap();
        s.update("processes", "p1", fields! { "priority" => 3 }).await.unwrap();

        let d = s.get("processes", "p1").await.unwrap();
        assert_eq!(d.version, 2);
        assert_eq!(d.fields.len(), 2);
        assert_eq!(s.list("processes", 0, 0).await.unwrap(), vec![d]);
    }
}
