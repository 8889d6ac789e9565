use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetTaskContextParams {
    #[schemars(description = "ID of the task")]
    pub task_id: String,
}
