use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

use keel_types::Document;

/// Default number of documents held by the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct CacheConfig {
    /// Maximum cached documents; 0 disables caching.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { capacity: DEFAULT_CACHE_CAPACITY }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Bounded LRU of decoded documents keyed by `"{collection}:{id}"`.
///
/// Entries are non-authoritative copies. The owner refreshes or invalidates
/// a key only after the durable write for it succeeded.
pub struct DocumentCache {
    entries: Option<Mutex<LruCache<String, Document>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DocumentCache {
    pub fn new(config: CacheConfig) -> Self {
        DocumentCache {
            entries: NonZeroUsize::new(config.capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Document> {
        let found = self.entries.as_ref().and_then(|c| c.lock().get(key).cloned());
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Lookup that does not touch recency or the hit counters.
    pub fn peek(&self, key: &str) -> Option<Document> {
        self.entries.as_ref().and_then(|c| c.lock().peek(key).cloned())
    }

    pub fn put(&self, key: String, doc: Document) {
        if let Some(c) = &self.entries {
            c.lock().put(key, doc);
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Some(c) = &self.entries {
            c.lock().pop(key);
        }
    }

    pub fn clear(&self) {
        if let Some(c) = &self.entries {
            c.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity) = self
            .entries
            .as_ref()
            .map(|c| {
                let g = c.lock();
                (g.len(), g.cap().get())
            })
            .unwrap_or((0, 0));
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }
}
