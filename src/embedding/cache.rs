//! Bounded LRU cache of embedding results.
//!
//! Keyed by (provider id, SHA-256 of the text) so the same text embedded by
//! two providers never collides. Entry count is capped; the least recently
//! used entry is evicted first.

use linked_hash_map::LinkedHashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider_id: String,
    content_hash: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct EmbeddingCache {
    entries: Mutex<LinkedHashMap<CacheKey, Arc<Vec<f32>>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// A cache holding at most `capacity` vectors (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LinkedHashMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(&self, provider_id: &str, text: &str) -> CacheKey {
        CacheKey {
            provider_id: provider_id.to_string(),
            content_hash: hex::encode(Sha256::digest(text.as_bytes())),
        }
    }

    /// Look up a vector, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<f32>>> {
        let hit = match self.entries.lock() {
            Ok(mut entries) => entries.get_refresh(key).map(|v| Arc::clone(v)),
            Err(_) => None,
        };
        match hit {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert (or refresh) a vector, evicting the oldest entries over capacity.
    pub fn insert(&self, key: CacheKey, vector: Vec<f32>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.insert(key, Arc::new(vector));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
