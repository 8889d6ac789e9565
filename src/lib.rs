//! Persistent memory and hybrid retrieval for AI coding assistants.
//!
//! Tessera keeps context across sessions as typed memory blocks in a single
//! SQLite file, finds them again with a fusion of BM25 keyword search and
//! embedding similarity, and compacts a session's blocks when they outgrow a
//! token budget.
//!
//! | Block type | Purpose | Compaction |
//! |------------|---------|------------|
//! | **Architectural** | Design decisions, constraints | Always retained |
//! | **Implementation** | Code-level details | Ranked by strategy |
//! | **Episodic** | Events, session logs, compaction summaries | Ranked by strategy |
//! | **Working** | Scratch state for the task at hand | Ranked by strategy |
//! | **Semantic** | Facts and knowledge | Ranked by strategy |
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) with an FTS5 external-content index and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) cosine distance over
//!   stored vectors; one writer, a pool of readers
//! - **Embeddings**: pluggable providers (local ONNX, OpenAI-compatible HTTP,
//!   deterministic hashing) behind an LRU cache and a timeout
//! - **Search**: normalized weighted-sum fusion; degrades to a single signal
//!   when the other fails
//! - **Transport**: MCP over stdio or streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: provider trait, providers, and the cached [`embedding::Embedder`]
//! - [`error`]: the [`MemoryError`] taxonomy
//! - [`memory`]: store, hybrid search, compaction, tasks and sessions
//! - [`service`]: the [`MemoryService`] facade shared by all sessions
//! - [`server`] / [`tools`]: the MCP surface

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod server;
pub mod service;
pub mod tools;

pub use error::{MemoryError, Result};
pub use service::{MemoryService, TaskContextView};
