//! Hybrid lexical + semantic retrieval.
//!
//! Both signals are normalized to `[0, 1]` and fused by weighted sum:
//! lexical BM25 scores are divided by the batch maximum, cosine similarity
//! is mapped through `(c + 1) / 2`. A block missing from one signal scores 0
//! for it. When one signal is unavailable the other carries full weight and
//! the response names the missing signal in `degraded`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SearchConfig;
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::memory::store::MemoryStore;
use crate::memory::types::MemoryBlock;

const WEIGHT_EPSILON: f64 = 1e-6;

/// Per-call overrides. `None` falls back to the engine's [`SearchConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    /// Given alone, the semantic weight becomes `1 - text_weight`.
    pub text_weight: Option<f64>,
    pub semantic_weight: Option<f64>,
    pub min_score_threshold: Option<f64>,
    /// Only return blocks attached to this task. Applied inside each
    /// signal's query, before candidates are cut to size.
    pub task_id: Option<String>,
}

/// A retrieval signal that can drop out of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Lexical,
    Semantic,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Lexical => "lexical",
            Self::Semantic => "semantic",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub block: MemoryBlock,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    /// Normalized lexical component, `None` if the block had no lexical match.
    pub lexical_score: Option<f64>,
    /// Normalized semantic component, `None` if the block had no vector match.
    pub semantic_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Signals that failed or timed out for this call. Empty on a full search.
    pub degraded: Vec<Signal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub text: f64,
    pub semantic: f64,
}

pub struct HybridSearchEngine {
    store: Arc<MemoryStore>,
    embedder: Option<Embedder>,
    config: SearchConfig,
}

/// Raw `(block, score)` pairs from one signal.
pub type Candidates = Vec<(MemoryBlock, f64)>;

impl HybridSearchEngine {
    pub fn new(store: Arc<MemoryStore>, embedder: Option<Embedder>, config: SearchConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run both signals concurrently and fuse them.
    ///
    /// The vector branch gets `vector_grace_ms` after the lexical branch
    /// finishes; past that the call returns lexical-only, and the detached
    /// embedding still lands in the cache for the next query.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MemoryError::validation("query must not be empty"));
        }
        let weights = self.resolve_weights(options)?;
        let limit = options.limit.unwrap_or(self.config.default_search_limit);
        let min_score = options
            .min_score_threshold
            .unwrap_or(self.config.min_score_threshold);
        if limit == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                degraded: Vec::new(),
            });
        }
        let candidates = self.config.max_candidates_per_signal.max(limit);

        let lexical_task = {
            let store = Arc::clone(&self.store);
            let q = query.to_string();
            let task = options.task_id.clone();
            tokio::task::spawn_blocking(move || store.lexical_search_scoped(&q, candidates, task.as_deref()))
        };
        let mut vector_task = self.embedder.clone().map(|embedder| {
            let store = Arc::clone(&self.store);
            let q = query.to_string();
            let task = options.task_id.clone();
            tokio::spawn(async move {
                let vector = embedder.embed(&q).await?;
                let model_id = embedder.model_id().to_string();
                tokio::task::spawn_blocking(move || {
                    store.vector_search_scoped(&vector, &model_id, candidates, task.as_deref())
                })
                .await?
            })
        });

        let lexical = flatten_join(lexical_task.await);
        let semantic: Option<Result<Candidates>> = match vector_task.as_mut() {
            None => None,
            Some(handle) if lexical.is_ok() => {
                let grace = Duration::from_millis(self.config.vector_grace_ms);
                match tokio::time::timeout(grace, handle).await {
                    Ok(joined) => Some(flatten_join(joined)),
                    Err(_) => {
                        tracing::warn!(
                            grace_ms = self.config.vector_grace_ms,
                            "vector search exceeded grace period, continuing lexical-only"
                        );
                        Some(Err(MemoryError::embedding(
                            self.embedder.as_ref().map(|e| e.model_id()).unwrap_or("none"),
                            "vector branch exceeded grace period",
                        )))
                    }
                }
            }
            // Lexical already failed, so the vector branch is all we have.
            Some(handle) => Some(flatten_join(handle.await)),
        };

        let mut degraded = Vec::new();
        let (lexical, semantic, weights) = match (lexical, semantic) {
            (Ok(lex), None) => (lex, Vec::new(), FusionWeights { text: 1.0, semantic: 0.0 }),
            (Ok(lex), Some(Ok(sem))) => (lex, sem, weights),
            (Ok(lex), Some(Err(e))) => {
                tracing::warn!(error = %e, "semantic signal unavailable, degrading to lexical-only");
                degraded.push(Signal::Semantic);
                (lex, Vec::new(), FusionWeights { text: 1.0, semantic: 0.0 })
            }
            (Err(e), Some(Ok(sem))) => {
                tracing::warn!(error = %e, "lexical signal failed, degrading to semantic-only");
                degraded.push(Signal::Lexical);
                (Vec::new(), sem, FusionWeights { text: 0.0, semantic: 1.0 })
            }
            (Err(e), None) => return Err(e),
            (Err(lex_err), Some(Err(sem_err))) => {
                tracing::error!(lexical = %lex_err, semantic = %sem_err, "both search signals failed");
                return Err(lex_err);
            }
        };

        let results = fuse(lexical, semantic, weights, min_score, limit);
        tracing::debug!(
            query,
            results = results.len(),
            degraded = ?degraded,
            "hybrid search complete"
        );

        let ids: Vec<String> = results.iter().map(|h| h.block.id.clone()).collect();
        if !ids.is_empty() {
            let store = Arc::clone(&self.store);
            let touched = tokio::task::spawn_blocking(move || store.touch_access(&ids)).await;
            if let Err(e) = flatten_join(touched) {
                tracing::warn!(error = %e, "failed to record access for search results");
            }
        }

        Ok(SearchResponse { results, degraded })
    }

    fn resolve_weights(&self, options: &SearchOptions) -> Result<FusionWeights> {
        let (text, semantic) = match (options.text_weight, options.semantic_weight) {
            (None, None) => (self.config.text_weight, self.config.semantic_weight),
            (Some(t), None) => (t, 1.0 - t),
            (None, Some(s)) => (1.0 - s, s),
            (Some(t), Some(s)) => (t, s),
        };
        let valid = |w: f64| w.is_finite() && (0.0..=1.0).contains(&w);
        if !valid(text) || !valid(semantic) || (text + semantic - 1.0).abs() > WEIGHT_EPSILON {
            return Err(MemoryError::validation(format!(
                "search weights must be in [0, 1] and sum to 1 (text={text}, semantic={semantic})"
            )));
        }
        Ok(FusionWeights { text, semantic })
    }
}

fn flatten_join<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(MemoryError::from)?
}

/// Divide by the batch maximum. An all-zero batch stays at zero.
pub fn normalize_lexical(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(0.0f64, f64::max);
    if max > 0.0 {
        scores.iter().map(|s| (s / max).clamp(0.0, 1.0)).collect()
    } else {
        vec![0.0; scores.len()]
    }
}

/// Map cosine similarity from `[-1, 1]` onto `[0, 1]`.
pub fn normalize_cosine(similarity: f64) -> f64 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Union both candidate lists by id, score, filter, sort and truncate.
///
/// Ties on score go to higher importance, then lower id.
pub fn fuse(
    lexical: Candidates,
    semantic: Candidates,
    weights: FusionWeights,
    min_score: f64,
    limit: usize,
) -> Vec<SearchHit> {
    let lex_norm = normalize_lexical(&lexical.iter().map(|(_, s)| *s).collect::<Vec<_>>());

    let mut merged: HashMap<String, SearchHit> = HashMap::new();
    for ((block, _), norm) in lexical.into_iter().zip(lex_norm) {
        merged.insert(
            block.id.clone(),
            SearchHit {
                block,
                score: 0.0,
                lexical_score: Some(norm),
                semantic_score: None,
            },
        );
    }
    for (block, cosine) in semantic {
        let norm = normalize_cosine(cosine);
        merged
            .entry(block.id.clone())
            .and_modify(|hit| hit.semantic_score = Some(norm))
            .or_insert(SearchHit {
                block,
                score: 0.0,
                lexical_score: None,
                semantic_score: Some(norm),
            });
    }

    let mut hits: Vec<SearchHit> = merged
        .into_values()
        .map(|mut hit| {
            hit.score = weights.text * hit.lexical_score.unwrap_or(0.0)
                + weights.semantic * hit.semantic_score.unwrap_or(0.0);
            hit
        })
        .filter(|hit| hit.score >= min_score)
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.block.importance.partial_cmp(&a.block.importance).unwrap_or(Ordering::Equal))
            .then_with(|| a.block.id.cmp(&b.block.id))
    });
    hits.truncate(limit);
    hits
}
