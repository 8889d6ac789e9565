//! MCP `search_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `search_memory` MCP tool. Unset fields use the server's
/// `[search]` config.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchMemoryParams {
    #[schemars(description = "Natural language or keyword query")]
    pub query: String,

    #[schemars(description = "Maximum number of results. Defaults to the configured search limit.")]
    pub limit: Option<usize>,

    #[schemars(description = "Only return blocks attached to this task")]
    pub task_id: Option<String>,

    #[schemars(
        description = "Weight of keyword (BM25) relevance, 0.0-1.0. The semantic weight becomes 1 - text_weight."
    )]
    pub text_weight: Option<f64>,

    #[schemars(description = "Drop results whose fused score is below this value (0.0-1.0)")]
    pub min_score: Option<f64>,

    #[schemars(description = "If true, return a truncated preview instead of full content")]
    pub summary_only: Option<bool>,
}
