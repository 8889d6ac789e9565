#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tessera::config::TesseraConfig;
use tessera::embedding::hash::HashEmbeddingProvider;
use tessera::embedding::{Embedder, EmbeddingCache, EmbeddingProvider};
use tessera::memory::store::MemoryStore;
use tessera::memory::types::{BlockType, NewBlock};
use tessera::MemoryService;

/// Open a fresh on-disk store with two reader connections. Keep the
/// `TempDir` alive for the duration of the test.
pub fn temp_store() -> (TempDir, Arc<MemoryStore>) {
    let tmp = TempDir::new().unwrap();
    let store = MemoryStore::open(tmp.path().join("memory.db"), 2).unwrap();
    (tmp, Arc::new(store))
}

/// Generate a deterministic unit vector with a spike at position `seed`.
pub fn test_embedding(seed: usize, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    v[seed % dims] = 1.0;
    v
}

pub fn hash_embedder(dims: usize) -> Embedder {
    embedder(Arc::new(HashEmbeddingProvider::new(dims)), 1000)
}

pub fn embedder(provider: Arc<dyn EmbeddingProvider>, timeout_ms: u64) -> Embedder {
    Embedder::new(
        provider,
        Arc::new(EmbeddingCache::new(128)),
        Duration::from_millis(timeout_ms),
    )
}

/// A service over a fresh on-disk store with default config.
pub fn temp_service(embedder: Option<Embedder>) -> (TempDir, MemoryService) {
    let (tmp, store) = temp_store();
    let service = MemoryService::new(store, embedder, &TesseraConfig::default());
    (tmp, service)
}

/// Build a block with a fixed id.
pub fn block(id: &str, session: &str, content: &str) -> NewBlock {
    let mut new = NewBlock::new(session, content).block_type(BlockType::Semantic);
    new.id = Some(id.to_string());
    new
}

/// A provider that fails every call.
pub struct FailingProvider;

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn id(&self) -> &str {
        "failing"
    }

    fn dimensions(&self) -> usize {
        16
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("connection refused")
    }
}

/// A provider that never answers within any reasonable timeout.
pub struct StalledProvider;

#[async_trait]
impl EmbeddingProvider for StalledProvider {
    fn id(&self) -> &str {
        "stalled"
    }

    fn dimensions(&self) -> usize {
        16
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![0.0; 16])
    }
}
