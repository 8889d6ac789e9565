//! MCP `store_block` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StoreBlockParams {
    #[schemars(description = "The content of the memory block")]
    pub content: String,

    #[schemars(description = "Session that produced this block. Created on first use.")]
    pub session_id: String,

    #[schemars(description = "Optional task this block belongs to. The task must exist.")]
    pub task_id: Option<String>,

    #[schemars(
        description = "Block type: 'architectural' (design decisions, never compacted away), 'implementation', 'episodic' (default), 'working', 'semantic'"
    )]
    pub block_type: Option<String>,

    #[schemars(description = "Short label used in compaction summaries. Defaults to the start of the content.")]
    pub label: Option<String>,

    #[schemars(description = "Importance 0.0-1.0. Defaults to 0.5.")]
    pub importance: Option<f64>,

    #[schemars(description = "IDs of blocks this block references. Each referenced block gains importance.")]
    pub references: Option<Vec<String>>,

    #[schemars(description = "Optional JSON object of extra fields")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}
