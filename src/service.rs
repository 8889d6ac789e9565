//! The programmatic boundary: one [`MemoryService`] per storage file, shared
//! by every session. Store work runs on the blocking pool; embedding calls
//! stay async.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TesseraConfig;
use crate::db::HealthReport;
use crate::embedding::{self, Embedder, EmbeddingCache};
use crate::error::Result;
use crate::memory::compact::{CompactOptions, CompactionResult, Compactor};
use crate::memory::estimate_tokens;
use crate::memory::search::{HybridSearchEngine, SearchOptions, SearchResponse};
use crate::memory::store::MemoryStore;
use crate::memory::tasks::DeleteTaskResult;
use crate::memory::types::{MemoryBlock, NewBlock, NewTask, SessionRecord, TaskContext, TaskStatus};

/// Upper bound on blocks returned by [`MemoryService::get_task_context`].
pub const TASK_CONTEXT_BLOCK_LIMIT: usize = 500;

/// A task with everything attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContextView {
    pub task: TaskContext,
    pub subtasks: Vec<TaskContext>,
    /// Importance desc, then newest first.
    pub blocks: Vec<MemoryBlock>,
    pub token_estimate: usize,
}

pub struct MemoryService {
    store: Arc<MemoryStore>,
    embedder: Option<Embedder>,
    search: HybridSearchEngine,
    compactor: Arc<Compactor>,
    chars_per_token: usize,
    /// Budget for automatic compaction after each stored block.
    session_budget_tokens: Option<usize>,
}

impl MemoryService {
    pub fn new(store: Arc<MemoryStore>, embedder: Option<Embedder>, config: &TesseraConfig) -> Self {
        Self {
            search: HybridSearchEngine::new(Arc::clone(&store), embedder.clone(), config.search.clone()),
            compactor: Arc::new(Compactor::new(Arc::clone(&store), config.compaction.clone())),
            chars_per_token: config.compaction.chars_per_token,
            session_budget_tokens: config.compaction.session_budget_tokens,
            store,
            embedder,
        }
    }

    /// Open the configured database and embedding provider.
    ///
    /// Warns when the provider differs from the one recorded by the previous
    /// start: stored vectors of the old model stay but no longer match queries.
    pub fn from_config(config: &TesseraConfig) -> anyhow::Result<Self> {
        let db_path = config.resolved_db_path();
        let store = MemoryStore::open(&db_path, config.storage.read_connections)?
            .with_reference_boost(config.storage.reference_boost);
        let store = Arc::new(store);

        // A provider that cannot start costs the semantic signal, not the service.
        let provider = embedding::create_provider(&config.embedding).unwrap_or_else(|e| {
            let reason = format!("{e:#}");
            tracing::warn!(
                provider = %config.embedding.provider,
                error = %reason,
                "embedding provider failed to start"
            );
            None
        });
        let embedder = provider.map(|provider| {
            Embedder::new(
                provider,
                Arc::new(EmbeddingCache::new(config.embedding.cache_size)),
                Duration::from_millis(config.embedding.timeout_ms),
            )
        });

        if let Some(e) = &embedder {
            match store.record_embedding_model(e.model_id())? {
                Some(previous) if previous != e.model_id() => tracing::warn!(
                    previous = %previous,
                    current = e.model_id(),
                    "embedding model changed; blocks embedded with the previous model are invisible to semantic search until re-embedded"
                ),
                _ => {}
            }
        } else {
            tracing::warn!("no embedding provider configured, search is lexical-only");
        }

        Ok(Self::new(store, embedder, config))
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn embedder(&self) -> Option<&Embedder> {
        self.embedder.as_ref()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Persist a block, then attach its embedding.
    ///
    /// An embedding failure does not fail the write: the block is still
    /// lexically searchable and is logged as missing a vector. With
    /// `compaction.session_budget_tokens` set, the block's session is then
    /// compacted once it crosses the threshold; the returned block may have
    /// been demoted into the session summary by that pass.
    pub async fn store_block(&self, new: NewBlock) -> Result<MemoryBlock> {
        let mut block = self.blocking(move |s| s.store_block(new)).await?;
        if let Some(model) = self.attach_embedding(&block.id, &block.content).await {
            block.embedding_model_id = Some(model);
        }

        if let Some(budget) = self.session_budget_tokens {
            match self
                .compact_if_needed(&block.session_id, budget, CompactOptions::default())
                .await
            {
                Ok(Some(result)) => tracing::info!(
                    session = %block.session_id,
                    dropped = result.dropped_ids.len(),
                    budget,
                    "automatic compaction ran"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(session = %block.session_id, error = %e, "automatic compaction failed"),
            }
        }
        Ok(block)
    }

    /// Embed `content` and store it for `block_id`, returning the model id on
    /// success. Failures are logged, never returned.
    async fn attach_embedding(&self, block_id: &str, content: &str) -> Option<String> {
        let embedder = self.embedder.as_ref()?;
        let vector = match embedder.embed(content).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(id = %block_id, error = %e, "block stored without embedding");
                return None;
            }
        };
        let id = block_id.to_string();
        let model = embedder.model_id().to_string();
        let model_for_store = model.clone();
        match self
            .blocking(move |s| s.upsert_embedding(&id, &model_for_store, &vector))
            .await
        {
            Ok(()) => Some(model),
            Err(e) => {
                tracing::warn!(id = %block_id, error = %e, "failed to store embedding");
                None
            }
        }
    }

    /// Give a freshly written compaction summary its vector.
    async fn embed_summary(&self, result: &CompactionResult) {
        if result.dropped_ids.is_empty() {
            return;
        }
        let Some(id) = &result.summary_block_id else {
            return;
        };
        match self.get_block(id).await {
            Ok(summary) => {
                self.attach_embedding(id, &summary.content).await;
            }
            Err(e) => tracing::warn!(id = %id, error = %e, "compaction summary vanished before embedding"),
        }
    }

    pub async fn get_block(&self, block_id: &str) -> Result<MemoryBlock> {
        let id = block_id.to_string();
        self.blocking(move |s| s.get_block(&id)).await
    }

    pub async fn delete_block(&self, block_id: &str) -> Result<()> {
        let id = block_id.to_string();
        self.blocking(move |s| s.delete_block(&id)).await
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        self.search.search(query, options).await
    }

    pub async fn compact(&self, session_id: &str, budget_tokens: usize) -> Result<CompactionResult> {
        self.compact_with(session_id, budget_tokens, CompactOptions::default())
            .await
    }

    pub async fn compact_with(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: CompactOptions,
    ) -> Result<CompactionResult> {
        let compactor = Arc::clone(&self.compactor);
        let session = session_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || compactor.compact_with(&session, budget_tokens, &options)).await??;
        self.embed_summary(&result).await;
        Ok(result)
    }

    pub async fn compact_if_needed(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: CompactOptions,
    ) -> Result<Option<CompactionResult>> {
        let compactor = Arc::clone(&self.compactor);
        let session = session_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            compactor.compact_if_needed(&session, budget_tokens, &options)
        })
        .await??;
        if let Some(result) = &result {
            self.embed_summary(result).await;
        }
        Ok(result)
    }

    pub async fn get_task_context(&self, task_id: &str) -> Result<TaskContextView> {
        let id = task_id.to_string();
        let chars_per_token = self.chars_per_token;
        self.blocking(move |s| {
            let task = s.get_task(&id)?;
            let subtasks = s.list_subtasks(&id)?;
            let blocks = s.get_blocks_by_task(&id, TASK_CONTEXT_BLOCK_LIMIT)?;
            let token_estimate = blocks
                .iter()
                .map(|b| estimate_tokens(&b.content, chars_per_token))
                .sum();
            Ok(TaskContextView {
                task,
                subtasks,
                blocks,
                token_estimate,
            })
        })
        .await
    }

    pub async fn create_task(&self, new: NewTask) -> Result<TaskContext> {
        self.blocking(move |s| s.create_task(new)).await
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let id = task_id.to_string();
        self.blocking(move |s| s.update_task_status(&id, status)).await
    }

    pub async fn delete_task(&self, task_id: &str, purge: bool) -> Result<DeleteTaskResult> {
        let id = task_id.to_string();
        self.blocking(move |s| s.delete_task(&id, purge)).await
    }

    pub async fn start_session(&self, session_id: &str, platform: Option<&str>) -> Result<SessionRecord> {
        let id = session_id.to_string();
        let platform = platform.map(str::to_string);
        self.blocking(move |s| s.start_session(&id, platform.as_deref()))
            .await
    }

    pub async fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<SessionRecord> {
        let id = session_id.to_string();
        let summary = summary.map(str::to_string);
        self.blocking(move |s| s.end_session(&id, summary.as_deref()))
            .await
    }

    /// Compact the session down to `budget_tokens` and close it with the
    /// resulting summary.
    pub async fn finalize_session(
        &self,
        session_id: &str,
        budget_tokens: usize,
        options: CompactOptions,
    ) -> Result<(CompactionResult, SessionRecord)> {
        let compactor = Arc::clone(&self.compactor);
        let session = session_id.to_string();
        let (result, record) = tokio::task::spawn_blocking(move || {
            compactor.finalize_session(&session, budget_tokens, &options)
        })
        .await??;
        self.embed_summary(&result).await;
        Ok((result, record))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.blocking(|s| s.health()).await
    }
}
