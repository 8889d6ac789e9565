pub mod compact_context;
pub mod create_task;
pub mod delete_block;
pub mod get_task_context;
pub mod search_memory;
pub mod store_block;

use compact_context::CompactContextParams;
use create_task::CreateTaskParams;
use delete_block::DeleteBlockParams;
use get_task_context::GetTaskContextParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use search_memory::SearchMemoryParams;
use serde::Serialize;
use std::sync::Arc;
use store_block::StoreBlockParams;

use crate::memory::compact::{CompactOptions, CompactionStrategy};
use crate::memory::search::SearchOptions;
use crate::memory::truncate_preview;
use crate::memory::types::{BlockType, NewBlock, NewTask, TaskStatus};
use crate::service::MemoryService;

/// Preview length for `summary_only` search results.
const PREVIEW_CHARS: usize = 120;

/// The Tessera MCP tool handler. Every tool is a thin adapter over
/// [`MemoryService`]; errors come back to the client as strings.
#[derive(Clone)]
pub struct TesseraTools {
    tool_router: ToolRouter<Self>,
    service: Arc<MemoryService>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

#[tool_router]
impl TesseraTools {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            service,
        }
    }

    #[tool(description = "Store a memory block for a session. Types: architectural (design decisions, pinned during compaction), implementation, episodic, working, semantic.")]
    async fn store_block(
        &self,
        Parameters(params): Parameters<StoreBlockParams>,
    ) -> Result<String, String> {
        let block_type = params
            .block_type
            .as_deref()
            .map(str::parse::<BlockType>)
            .transpose()
            .map_err(|e| e.to_string())?;

        tracing::info!(
            content_len = params.content.len(),
            session = %params.session_id,
            task = ?params.task_id,
            "store_block called"
        );

        let new = NewBlock {
            task_id: params.task_id,
            session_id: params.session_id,
            content: params.content,
            block_type,
            label: params.label,
            importance: params.importance,
            metadata: params.metadata.unwrap_or_default(),
            relationships: params.references.unwrap_or_default(),
            ..Default::default()
        };
        let block = self.service.store_block(new).await.map_err(|e| e.to_string())?;

        tracing::info!(id = %block.id, "block stored");
        to_json(&serde_json::json!({
            "id": block.id,
            "label": block.label,
            "block_type": block.block_type,
            "importance": block.importance,
            "embedded": block.embedding_model_id.is_some(),
        }))
    }

    #[tool(description = "Search memory blocks with hybrid keyword (BM25) + semantic search. Reports any degraded signal.")]
    async fn search_memory(
        &self,
        Parameters(params): Parameters<SearchMemoryParams>,
    ) -> Result<String, String> {
        tracing::info!(query = %params.query, "search_memory called");

        let options = SearchOptions {
            limit: params.limit,
            text_weight: params.text_weight,
            semantic_weight: None,
            min_score_threshold: params.min_score,
            task_id: params.task_id,
        };
        let response = self
            .service
            .search(&params.query, &options)
            .await
            .map_err(|e| e.to_string())?;

        if params.summary_only.unwrap_or(false) {
            let results: Vec<_> = response
                .results
                .iter()
                .map(|hit| {
                    serde_json::json!({
                        "id": hit.block.id,
                        "label": hit.block.label,
                        "block_type": hit.block.block_type,
                        "preview": truncate_preview(&hit.block.content, PREVIEW_CHARS),
                        "score": hit.score,
                    })
                })
                .collect();
            return to_json(&serde_json::json!({
                "results": results,
                "degraded": response.degraded,
            }));
        }
        to_json(&response)
    }

    #[tool(description = "Compact a session's blocks to fit a token budget. Architectural blocks are kept; dropped blocks are summarized into a new episodic block.")]
    async fn compact_context(
        &self,
        Parameters(params): Parameters<CompactContextParams>,
    ) -> Result<String, String> {
        let strategy = params
            .strategy
            .as_deref()
            .map(str::parse::<CompactionStrategy>)
            .transpose()
            .map_err(|e| e.to_string())?;

        tracing::info!(
            session = %params.session_id,
            budget = params.budget_tokens,
            "compact_context called"
        );

        let options = CompactOptions {
            strategy,
            threshold_fraction: params.threshold_fraction,
        };

        if params.finalize.unwrap_or(false) {
            let (result, session) = self
                .service
                .finalize_session(&params.session_id, params.budget_tokens, options)
                .await
                .map_err(|e| e.to_string())?;
            return to_json(&serde_json::json!({"compaction": result, "session": session}));
        }

        if params.only_if_needed.unwrap_or(false) {
            let result = self
                .service
                .compact_if_needed(&params.session_id, params.budget_tokens, options)
                .await
                .map_err(|e| e.to_string())?;
            return match result {
                Some(result) => to_json(&result),
                None => to_json(&serde_json::json!({"compacted": false})),
            };
        }

        let result = self
            .service
            .compact_with(&params.session_id, params.budget_tokens, options)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&result)
    }

    #[tool(description = "Get a task with its subtasks, its blocks in importance order, and a token estimate.")]
    async fn get_task_context(
        &self,
        Parameters(params): Parameters<GetTaskContextParams>,
    ) -> Result<String, String> {
        tracing::info!(task = %params.task_id, "get_task_context called");
        let view = self
            .service
            .get_task_context(&params.task_id)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&view)
    }

    #[tool(description = "Delete a block (with its index entry and embeddings) or a task. Requires confirm=true as a safety gate.")]
    async fn delete_block(
        &self,
        Parameters(params): Parameters<DeleteBlockParams>,
    ) -> Result<String, String> {
        if !params.confirm {
            return Err("confirm must be true to delete".into());
        }

        match (params.block_id, params.task_id) {
            (Some(block_id), None) => {
                tracing::info!(id = %block_id, "delete_block called");
                self.service
                    .delete_block(&block_id)
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(&serde_json::json!({"deleted": block_id}))
            }
            (None, Some(task_id)) => {
                let purge = params.purge.unwrap_or(false);
                tracing::info!(task = %task_id, purge, "delete_block called for task");
                let result = self
                    .service
                    .delete_task(&task_id, purge)
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(&result)
            }
            _ => Err("provide exactly one of block_id or task_id".into()),
        }
    }

    #[tool(description = "Create a task (optionally as a subtask) that blocks can be attached to.")]
    async fn create_task(
        &self,
        Parameters(params): Parameters<CreateTaskParams>,
    ) -> Result<String, String> {
        let status = params
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();

        tracing::info!(title = %params.title, parent = ?params.parent_id, "create_task called");
        let task = self
            .service
            .create_task(NewTask {
                id: params.id,
                parent_id: params.parent_id,
                title: params.title,
                status,
            })
            .await
            .map_err(|e| e.to_string())?;
        to_json(&task)
    }
}

#[tool_handler]
impl ServerHandler for TesseraTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Tessera is a persistent memory server. Use store_block to save context, \
                 search_memory to retrieve it, and compact_context to stay within a token budget."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
