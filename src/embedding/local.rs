//! Local ONNX Runtime embedding provider.
//!
//! Runs a sentence-transformer export (all-MiniLM-L6-v2 by default) via
//! `ort`: tokenization, inference, attention-masked mean pooling, and L2
//! normalization. Inference is CPU-bound, so it runs on the blocking pool.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

struct LocalModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
// The Mutex guarantees exclusive access during run().
unsafe impl Send for LocalModel {}
unsafe impl Sync for LocalModel {}

pub struct LocalEmbeddingProvider {
    id: String,
    model: Arc<LocalModel>,
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Place model.onnx and tokenizer.json in embedding.cache_dir, \
             or set embedding.provider = \"hash\" or \"none\".",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}",
            tokenizer_path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            id: config.model.clone(),
            model: Arc::new(LocalModel {
                session: Mutex::new(session),
                tokenizer,
                dimensions: config.dimensions,
            }),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimensions(&self) -> usize {
        self.model.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .context("batch had one input but produced no output")
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let model = Arc::clone(&self.model);
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        tokio::task::spawn_blocking(move || model.run(owned))
            .await
            .context("embedding task panicked")?
    }
}

impl LocalModel {
    fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let batch = encodings.len();
        let seq = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let ids: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&id| id as i64))
            .collect();
        let mask: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&m| m as i64))
            .collect();
        let shape = vec![batch as i64, seq as i64];
        let input_ids = Tensor::from_array((shape.clone(), ids.into_boxed_slice()))?;
        let attention_mask = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))?;
        let token_type_ids = Tensor::from_array((shape, vec![0i64; batch * seq].into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        // Exports disagree on the output name.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (out_shape, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;

        let dims: &[i64] = &out_shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[0] == batch as i64 && dims[1] == seq as i64 && dims[2] == self.dimensions as i64,
            "unexpected output shape {dims:?}, expected [{batch}, {seq}, {}]",
            self.dimensions
        );

        Ok(mean_pool(data, &mask, seq, self.dimensions)
            .iter()
            .map(|v| l2_normalize(v))
            .collect())
    }
}

/// Average each sequence's token vectors, counting only positions whose
/// attention mask is set. `data` is `[batch, seq, hidden]` row-major.
fn mean_pool(data: &[f32], mask: &[i64], seq: usize, hidden: usize) -> Vec<Vec<f32>> {
    mask.chunks(seq.max(1))
        .enumerate()
        .map(|(b, row)| {
            let mut pooled = vec![0.0f32; hidden];
            let mut count = 0usize;
            for (s, &m) in row.iter().enumerate() {
                if m == 0 {
                    continue;
                }
                let offset = (b * seq + s) * hidden;
                for (acc, x) in pooled.iter_mut().zip(&data[offset..offset + hidden]) {
                    *acc += x;
                }
                count += 1;
            }
            if count > 0 {
                pooled.iter_mut().for_each(|x| *x /= count as f32);
            }
            pooled
        })
        .collect()
}
