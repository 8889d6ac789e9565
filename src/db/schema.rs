//! SQL DDL for all Tessera tables.
//!
//! Defines `tasks`, `sessions`, `blocks`, `blocks_fts` (FTS5, external
//! content), `block_relationships`, `embedding_models`, `embeddings`,
//! `block_log`, and `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Task hierarchy
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    parent_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','in_progress','done','blocked')),
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

-- Sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    platform TEXT,
    summary TEXT
);

-- Memory blocks
CREATE TABLE IF NOT EXISTS blocks (
    id TEXT PRIMARY KEY,
    task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    content TEXT NOT NULL,
    block_type TEXT NOT NULL CHECK(block_type IN ('architectural','implementation','episodic','working','semantic')),
    label TEXT NOT NULL,
    importance REAL NOT NULL CHECK(importance >= 0.0 AND importance <= 1.0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    embedding_model_id TEXT,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_blocks_task ON blocks(task_id, importance DESC);
CREATE INDEX IF NOT EXISTS idx_blocks_session ON blocks(session_id);
CREATE INDEX IF NOT EXISTS idx_blocks_type ON blocks(block_type);

-- Full-text search (BM25), synced by hand in the same transaction as blocks
CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(
    content,
    id UNINDEXED,
    content='blocks',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

-- Outgoing references, ordered; targets are resolved lazily and may dangle
CREATE TABLE IF NOT EXISTS block_relationships (
    block_id TEXT NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    target_id TEXT NOT NULL,
    PRIMARY KEY (block_id, position)
);

CREATE INDEX IF NOT EXISTS idx_relationships_target ON block_relationships(target_id);

-- Declared dimensionality per embedding model
CREATE TABLE IF NOT EXISTS embedding_models (
    model_id TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL CHECK(dimensions > 0)
);

-- One vector per (block, model)
CREATE TABLE IF NOT EXISTS embeddings (
    block_id TEXT NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
    model_id TEXT NOT NULL REFERENCES embedding_models(model_id),
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(block_id, model_id)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);

-- Audit log
CREATE TABLE IF NOT EXISTS block_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','embed','delete','compact')),
    block_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
