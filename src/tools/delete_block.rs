//! MCP `delete_block` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteBlockParams {
    #[schemars(description = "ID of the block to delete, with its index entry and embeddings")]
    pub block_id: Option<String>,

    #[schemars(description = "Delete a task instead. Its blocks are orphaned unless purge is true.")]
    pub task_id: Option<String>,

    #[schemars(description = "With task_id: delete the task's blocks too")]
    pub purge: Option<bool>,

    /// Safety gate: must be `true` to proceed.
    #[schemars(description = "Must be true to confirm deletion")]
    pub confirm: bool,
}
