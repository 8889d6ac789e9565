//! Text-to-vector embedding pipeline.
//!
//! Providers implement [`EmbeddingProvider`]: a stable `id`, a fixed
//! `dimensions`, and async `embed` / `embed_batch`. Callers never talk to a
//! provider directly; they go through an [`Embedder`], which adds the shared
//! [`EmbeddingCache`], a per-call timeout, and dimension checking, and turns
//! every failure into [`MemoryError::EmbeddingUnavailable`].

pub mod cache;
pub mod hash;
pub mod http;
pub mod local;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use cache::EmbeddingCache;

use crate::config::EmbeddingConfig;
use crate::error::{MemoryError, Result};

/// Trait for embedding text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier, stored as the embedding's model id.
    fn id(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> AnyResult<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    async fn embed_batch(&self, texts: &[&str]) -> AnyResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Create an embedding provider from config. `"none"` disables the semantic
/// signal entirely.
pub fn create_provider(config: &EmbeddingConfig) -> AnyResult<Option<Arc<dyn EmbeddingProvider>>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "none" => return Ok(None),
        "local" => Arc::new(local::LocalEmbeddingProvider::new(config)?),
        "http" => Arc::new(http::HttpEmbeddingProvider::new(config)?),
        "hash" => Arc::new(hash::HashEmbeddingProvider::new(config.dimensions)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, http, hash, none"),
    };
    tracing::info!(provider = provider.id(), dimensions = provider.dimensions(), "embedding provider ready");
    Ok(Some(provider))
}

/// The model id a provider built from `config` would record, without
/// loading it. `None` when embeddings are disabled or the provider is unknown.
pub fn configured_model_id(config: &EmbeddingConfig) -> Option<String> {
    match config.provider.as_str() {
        "local" | "http" => Some(config.model.clone()),
        "hash" => Some(hash::hash_model_id(config.dimensions)),
        _ => None,
    }
}

/// Cached, timeout-bounded front door to one provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    timeout: Duration,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>, timeout: Duration) -> Self {
        Self {
            provider,
            cache,
            timeout,
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.id()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed one text, consulting the cache first.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.cache.key(self.model_id(), text);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.as_ref().clone());
        }

        let vector = match tokio::time::timeout(self.timeout, self.provider.embed(text)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(self.unavailable(format!("{e:#}"))),
            Err(_) => return Err(self.timed_out()),
        };
        self.check_dimensions(&vector)?;
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// Embed many texts; only cache misses reach the provider, in one batch.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<_> = texts.iter().map(|t| self.cache.key(self.model_id(), t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = keys
            .iter()
            .map(|k| self.cache.get(k).map(|v| v.as_ref().clone()))
            .collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|i| out[*i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|i| texts[*i]).collect();
            let vectors = match tokio::time::timeout(self.timeout, self.provider.embed_batch(&batch)).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(self.unavailable(format!("{e:#}"))),
                Err(_) => return Err(self.timed_out()),
            };
            if vectors.len() != batch.len() {
                return Err(self.unavailable(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (i, vector) in missing.into_iter().zip(vectors) {
                self.check_dimensions(&vector)?;
                self.cache.insert(keys[i].clone(), vector.clone());
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimensions() {
            Ok(())
        } else {
            Err(self.unavailable(format!(
                "expected {} dimensions, got {}",
                self.dimensions(),
                vector.len()
            )))
        }
    }

    fn unavailable(&self, reason: String) -> MemoryError {
        tracing::warn!(provider = self.model_id(), %reason, "embedding failed");
        MemoryError::embedding(self.model_id(), reason)
    }

    fn timed_out(&self) -> MemoryError {
        self.unavailable(format!("timed out after {}ms", self.timeout.as_millis()))
    }
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
