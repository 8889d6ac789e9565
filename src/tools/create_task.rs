use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateTaskParams {
    #[schemars(description = "Human-readable task title")]
    pub title: String,

    #[schemars(description = "Optional explicit task ID. Generated if omitted.")]
    pub id: Option<String>,

    #[schemars(description = "Optional parent task ID for subtasks")]
    pub parent_id: Option<String>,

    #[schemars(description = "Status: 'pending' (default), 'in_progress', 'done', 'blocked'")]
    pub status: Option<String>,
}
