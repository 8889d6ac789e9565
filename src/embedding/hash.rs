//! Deterministic feature-hashing embeddings.
//!
//! Each lowercased alphanumeric token is hashed (SHA-256) to a bucket and a
//! sign; the bucket counts are L2-normalized. No model files, no network:
//! useful offline and wherever reproducible vectors matter more than quality.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider};

/// Model id recorded for hash vectors of the given width.
pub fn hash_model_id(dimensions: usize) -> String {
    format!("hash-{}", dimensions.max(1))
}

pub struct HashEmbeddingProvider {
    id: String,
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            id: hash_model_id(dimensions),
            dimensions,
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
            ]) as usize
                % self.dimensions;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&v)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}
