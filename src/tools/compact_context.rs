use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CompactContextParams {
    #[schemars(description = "Session whose blocks should be compacted")]
    pub session_id: String,

    #[schemars(description = "Token budget the retained blocks must fit in")]
    pub budget_tokens: usize,

    #[schemars(description = "Retention strategy: 'importance' (default), 'fifo', or 'lru'")]
    pub strategy: Option<String>,

    #[schemars(
        description = "If true, only compact when usage has reached the threshold fraction of the budget"
    )]
    pub only_if_needed: Option<bool>,

    #[schemars(description = "Threshold fraction in (0, 1] for only_if_needed. Defaults to the configured value.")]
    pub threshold_fraction: Option<f64>,

    #[schemars(description = "If true, also end the session and store the summary on it")]
    pub finalize: Option<bool>,
}
