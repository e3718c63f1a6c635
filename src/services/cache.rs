//! Query-embedding cache with LFU eviction.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::traits::QueryKind;

struct Entry {
    embedding: Arc<Vec<f32>>,
    uses: u64,
}

/// A thread-safe LFU cache of query embeddings.
///
/// A `max_size` of zero disables caching.
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    max_size: usize,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_size,
        }
    }

    /// Cache key for a payload of the given kind.
    pub fn generate_key(bytes: &[u8], kind: QueryKind) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.uses += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.embedding))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, embedding: Arc<Vec<f32>>) {
        if self.max_size == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            Self::evict_lfu(&mut entries);
        }
        entries.insert(key, Entry { embedding, uses: 1 });
    }

    fn evict_lfu(entries: &mut HashMap<String, Entry>) {
        if let Some(lfu_key) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.uses)
            .map(|(key, _)| key.clone())
        {
            entries.remove(&lfu_key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        CacheStats {
            size,
            capacity: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
