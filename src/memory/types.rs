//! Core record type definitions.
//!
//! Defines [`BlockType`], [`TaskStatus`], [`MemoryBlock`] (a stored record),
//! [`NewBlock`] (a write request), [`TaskContext`], [`SessionRecord`], and
//! [`EmbeddingVector`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MemoryError;

/// Category of a memory block. Drives compaction pinning and summary typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Design decisions and constraints. Pinned during compaction.
    Architectural,
    /// Concrete code-level details.
    Implementation,
    /// Events and session logs; compaction summaries are written as this type.
    Episodic,
    /// Scratch state for the task at hand.
    Working,
    /// Facts and knowledge.
    Semantic,
}

impl BlockType {
    pub const ALL: [BlockType; 5] = [
        Self::Architectural,
        Self::Implementation,
        Self::Episodic,
        Self::Working,
        Self::Semantic,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architectural => "architectural",
            Self::Implementation => "implementation",
            Self::Episodic => "episodic",
            Self::Working => "working",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MemoryError::validation(format!("unknown block type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            _ => Err(MemoryError::validation(format!("unknown task status: {s}"))),
        }
    }
}

/// A stored memory block, matching the `blocks` table plus its ordered
/// relationship ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// UUID v7 unless supplied by the caller. Never changes.
    pub id: String,
    pub task_id: Option<String>,
    pub session_id: String,
    pub content: String,
    pub block_type: BlockType,
    pub label: String,
    /// Always within `[0.0, 1.0]`.
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the block was returned by a search, `None` if never.
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: u32,
    /// Model of the most recently attached embedding.
    pub embedding_model_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Ids this block references, in caller order. Targets may not exist.
    pub relationships: Vec<String>,
}

/// A request to store a block. Optional fields are filled by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBlock {
    pub id: Option<String>,
    pub task_id: Option<String>,
    pub session_id: String,
    pub content: String,
    pub block_type: Option<BlockType>,
    pub label: Option<String>,
    pub importance: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relationships: Vec<String>,
}

impl NewBlock {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn block_type(mut self, block_type: BlockType) -> Self {
        self.block_type = Some(block_type);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn references(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relationships = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// A node in the task hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Set by a soft delete; soft-deleted tasks are invisible to lookups.
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
}

/// One assistant session. `summary` is written by the compactor at session end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub platform: Option<String>,
    pub summary: Option<String>,
}

/// A stored vector for one (block, model) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingVector {
    pub block_id: String,
    pub model_id: String,
    pub dimensions: usize,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}
