//! Write and read paths for memory blocks, their lexical index, and their
//! embeddings.
//!
//! [`MemoryStore`] owns one writer connection and a small pool of query-only
//! readers on the same WAL database. Every mutation runs in a single
//! `BEGIN IMMEDIATE` transaction that keeps `blocks`, `blocks_fts`,
//! `block_relationships`, and `embeddings` in lockstep, so a reader can never
//! observe a block without its index entry.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::types::{BlockType, EmbeddingVector, MemoryBlock, NewBlock};
use super::{embedding_to_bytes, format_timestamp, now, parse_timestamp, stored_precision};
use crate::db;
use crate::error::{MemoryError, Result};

/// Write attempts after the first when SQLite reports busy/locked.
const MAX_WRITE_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(25);

/// Importance assigned when a write request does not carry one.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Column list shared by every block query. Callers alias `blocks` as `b`.
pub(crate) const BLOCK_COLUMNS: &str = "b.id, b.task_id, b.session_id, b.content, b.block_type, \
     b.label, b.importance, b.created_at, b.updated_at, b.last_accessed, b.access_count, \
     b.embedding_model_id, b.metadata";

/// Number of columns in [`BLOCK_COLUMNS`]; extra selected values start here.
pub(crate) const BLOCK_COLUMN_COUNT: usize = 13;

/// Shared handle to one storage file.
pub struct MemoryStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    reference_boost: f64,
}

impl MemoryStore {
    /// Open (or create) the store at `path` with `read_connections` readers.
    pub fn open(path: impl AsRef<Path>, read_connections: usize) -> Result<Self> {
        let path = path.as_ref();
        let writer = db::open_database(path).map_err(bootstrap_err)?;
        let readers = (0..read_connections)
            .map(|_| db::open_reader(path).map_err(bootstrap_err))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(path = %path.display(), readers = readers.len(), "memory store opened");
        Ok(Self::from_parts(writer, readers))
    }

    /// Single-connection in-memory store; reads share the writer.
    pub fn open_in_memory() -> Result<Self> {
        let writer = db::open_memory_database().map_err(bootstrap_err)?;
        Ok(Self::from_parts(writer, Vec::new()))
    }

    fn from_parts(writer: Connection, readers: Vec<Connection>) -> Self {
        Self {
            writer: Mutex::new(writer),
            readers: readers.into_iter().map(Mutex::new).collect(),
            next_reader: AtomicUsize::new(0),
            reference_boost: 0.05,
        }
    }

    /// Importance added to a block each time a new block references it.
    pub fn with_reference_boost(mut self, boost: f64) -> Self {
        self.reference_boost = boost.clamp(0.0, 1.0);
        self
    }

    /// Run `f` on a reader connection. Falls back to the writer when the store
    /// has no dedicated readers.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.readers.is_empty() {
            let conn = self.writer.lock().map_err(|_| poisoned())?;
            return f(&conn);
        }

        let len = self.readers.len();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            if let Ok(conn) = self.readers[(start + offset) % len].try_lock() {
                return f(&conn);
            }
        }
        let conn = self.readers[start].lock().map_err(|_| poisoned())?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction on the writer, retrying with
    /// exponential backoff while the database reports busy.
    pub(crate) fn write<T>(&self, mut f: impl FnMut(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(|_| poisoned())?;
        let mut attempt = 0;
        loop {
            let outcome: Result<T> = (|| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })();

            match outcome {
                Err(err) if err.is_retryable() && attempt < MAX_WRITE_RETRIES => {
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "write busy, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    /// Validate and persist a block with its lexical index entry and
    /// relationships in one transaction.
    pub fn store_block(&self, new: NewBlock) -> Result<MemoryBlock> {
        let block = prepare_block(new)?;
        let boost = self.reference_boost;

        self.write(|tx| insert_block_in_tx(tx, &block, boost))?;

        tracing::debug!(id = %block.id, block_type = %block.block_type, "block stored");
        Ok(block)
    }

    /// Fetch one block with its relationship ids.
    pub fn get_block(&self, block_id: &str) -> Result<MemoryBlock> {
        self.read(|conn| {
            fetch_block(conn, block_id)?.ok_or_else(|| MemoryError::not_found("block", block_id))
        })
    }

    /// Blocks owned by a task: importance desc, then newest first, then id.
    pub fn get_blocks_by_task(&self, task_id: &str, limit: usize) -> Result<Vec<MemoryBlock>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.task_id = ?1 \
                 ORDER BY b.importance DESC, b.created_at DESC, b.id ASC LIMIT ?2"
            );
            query_blocks(conn, &sql, params![task_id, limit as i64])
        })
    }

    /// All blocks captured in a session, oldest first.
    pub fn get_blocks_by_session(&self, session_id: &str) -> Result<Vec<MemoryBlock>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.session_id = ?1 \
                 ORDER BY b.created_at ASC, b.id ASC"
            );
            query_blocks(conn, &sql, params![session_id])
        })
    }

    /// BM25 keyword search over block content.
    ///
    /// Scores are FTS5's `bm25()` negated, so higher is better and every
    /// score is non-negative. Results are sorted descending, at most `limit`.
    pub fn lexical_search(&self, query: &str, limit: usize) -> Result<Vec<(MemoryBlock, f64)>> {
        self.lexical_search_scoped(query, limit, None)
    }

    /// [`lexical_search`](Self::lexical_search) restricted to one task's
    /// blocks when `task_id` is set. The filter runs inside the query, so
    /// `limit` counts only matching blocks.
    pub fn lexical_search_scoped(
        &self,
        query: &str,
        limit: usize,
        task_id: Option<&str>,
    ) -> Result<Vec<(MemoryBlock, f64)>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        self.read(|conn| {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS}, blocks_fts.rank FROM blocks_fts \
                 JOIN blocks b ON b.rowid = blocks_fts.rowid \
                 WHERE blocks_fts MATCH ?1 AND (?3 IS NULL OR b.task_id = ?3) \
                 ORDER BY blocks_fts.rank, b.id LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![escaped, limit as i64, task_id], |row| {
                    let rank: f64 = row.get(BLOCK_COLUMN_COUNT)?;
                    Ok((row_to_block(row)?, (-rank).max(0.0)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            with_relationships(conn, rows)
        })
    }

    /// Cosine-similarity search among blocks that hold an embedding for
    /// `model_id` with the query's dimensionality. Similarities are in
    /// `[-1, 1]`, sorted descending.
    pub fn vector_search(
        &self,
        query: &[f32],
        model_id: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryBlock, f64)>> {
        self.vector_search_scoped(query, model_id, limit, None)
    }

    /// [`vector_search`](Self::vector_search) restricted to one task's blocks
    /// when `task_id` is set.
    pub fn vector_search_scoped(
        &self,
        query: &[f32],
        model_id: &str,
        limit: usize,
        task_id: Option<&str>,
    ) -> Result<Vec<(MemoryBlock, f64)>> {
        validate_vector(query)?;
        if is_zero(query) || limit == 0 {
            return Ok(Vec::new());
        }

        self.read(|conn| {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS}, vec_distance_cosine(e.vector, ?1) AS distance \
                 FROM embeddings e JOIN blocks b ON b.id = e.block_id \
                 WHERE e.model_id = ?2 AND e.dimensions = ?3 AND (?5 IS NULL OR b.task_id = ?5) \
                 ORDER BY distance ASC, b.id ASC LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        embedding_to_bytes(query),
                        model_id,
                        query.len() as i64,
                        limit as i64,
                        task_id
                    ],
                    |row| {
                        let distance: f64 = row.get(BLOCK_COLUMN_COUNT)?;
                        Ok((row_to_block(row)?, (1.0 - distance).clamp(-1.0, 1.0)))
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            with_relationships(conn, rows)
        })
    }

    /// Attach (or replace) the embedding for `(block_id, model_id)`.
    ///
    /// The first vector seen for a model fixes that model's dimensionality;
    /// later vectors of a different length are rejected.
    pub fn upsert_embedding(&self, block_id: &str, model_id: &str, vector: &[f32]) -> Result<()> {
        if model_id.trim().is_empty() {
            return Err(MemoryError::validation("model id must not be empty"));
        }
        validate_vector(vector)?;
        if is_zero(vector) {
            return Err(MemoryError::validation("embedding must not be the zero vector"));
        }

        self.write(|tx| {
            ensure_block(tx, block_id)?;

            let declared: Option<i64> = tx
                .query_row(
                    "SELECT dimensions FROM embedding_models WHERE model_id = ?1",
                    params![model_id],
                    |row| row.get(0),
                )
                .optional()?;
            match declared {
                Some(dims) if dims as usize != vector.len() => {
                    return Err(MemoryError::validation(format!(
                        "model {model_id} declares {dims} dimensions, got {}",
                        vector.len()
                    )));
                }
                Some(_) => {}
                None => {
                    tx.execute(
                        "INSERT INTO embedding_models (model_id, dimensions) VALUES (?1, ?2)",
                        params![model_id, vector.len() as i64],
                    )?;
                }
            }

            let ts = format_timestamp(&now());
            tx.execute(
                "INSERT INTO embeddings (block_id, model_id, dimensions, vector, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(block_id, model_id) DO UPDATE SET \
                 dimensions = excluded.dimensions, vector = excluded.vector, created_at = excluded.created_at",
                params![block_id, model_id, vector.len() as i64, embedding_to_bytes(vector), ts],
            )?;
            tx.execute(
                "UPDATE blocks SET embedding_model_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![model_id, ts, block_id],
            )?;
            write_audit_log(
                tx,
                "embed",
                block_id,
                Some(&serde_json::json!({"model": model_id, "dimensions": vector.len()})),
            )?;
            Ok(())
        })
    }

    /// All embeddings attached to a block, ordered by model id.
    pub fn get_embeddings(&self, block_id: &str) -> Result<Vec<EmbeddingVector>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT block_id, model_id, dimensions, vector, created_at FROM embeddings \
                 WHERE block_id = ?1 ORDER BY model_id",
            )?;
            let rows = stmt
                .query_map(params![block_id], |row| {
                    let bytes: Vec<u8> = row.get(3)?;
                    let created: String = row.get(4)?;
                    Ok(EmbeddingVector {
                        block_id: row.get(0)?,
                        model_id: row.get(1)?,
                        dimensions: row.get::<_, i64>(2)? as usize,
                        vector: super::bytes_to_embedding(&bytes),
                        created_at: parse_timestamp(4, &created)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Atomically remove a block, its lexical entry, relationships, and
    /// embeddings.
    pub fn delete_block(&self, block_id: &str) -> Result<()> {
        let boost = self.reference_boost;
        self.write(|tx| delete_block_in_tx(tx, block_id, boost, None))?;
        tracing::debug!(id = %block_id, "block deleted");
        Ok(())
    }

    /// Explicitly set a block's importance.
    pub fn set_importance(&self, block_id: &str, importance: f64) -> Result<()> {
        validate_importance(importance)?;
        self.write(|tx| {
            let ts = format_timestamp(&now());
            let rows = tx.execute(
                "UPDATE blocks SET importance = ?1, updated_at = ?2 WHERE id = ?3",
                params![importance, ts, block_id],
            )?;
            if rows == 0 {
                return Err(MemoryError::not_found("block", block_id));
            }
            write_audit_log(
                tx,
                "update",
                block_id,
                Some(&serde_json::json!({"importance": importance})),
            )?;
            Ok(())
        })
    }

    /// Record that `ids` were returned to a caller. Feeds LRU compaction.
    pub fn touch_access(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.write(|tx| {
            let ts = format_timestamp(&now());
            let mut stmt = tx.prepare(
                "UPDATE blocks SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            )?;
            for id in ids {
                stmt.execute(params![ts, id])?;
            }
            Ok(())
        })
    }

    /// Resolve a block's references to the blocks that still exist, in the
    /// stored order. Dangling ids are skipped.
    pub fn resolve_relationships(&self, block_id: &str) -> Result<Vec<MemoryBlock>> {
        self.read(|conn| {
            let targets = load_relationships(conn, block_id)?;
            let mut resolved = Vec::with_capacity(targets.len());
            for target in targets {
                if let Some(block) = fetch_block(conn, &target)? {
                    resolved.push(block);
                }
            }
            Ok(resolved)
        })
    }

    /// Current number of stored blocks.
    pub fn block_count(&self) -> Result<usize> {
        self.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    pub(crate) fn reference_boost(&self) -> f64 {
        self.reference_boost
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    pub fn health(&self) -> Result<db::HealthReport> {
        self.read(|conn| db::check_database_health(conn).map_err(bootstrap_err))
    }

    /// Record `model_id` as the active embedding model, returning the id that
    /// was recorded before it (if any).
    pub fn record_embedding_model(&self, model_id: &str) -> Result<Option<String>> {
        self.write(|tx| {
            let previous = db::migrations::get_embedding_model(tx)?;
            db::migrations::set_embedding_model(tx, model_id)?;
            Ok(previous)
        })
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

pub(crate) fn prepare_block(new: NewBlock) -> Result<MemoryBlock> {
    if new.content.trim().is_empty() {
        return Err(MemoryError::validation("content must not be empty"));
    }
    if new.session_id.trim().is_empty() {
        return Err(MemoryError::validation("session id must not be empty"));
    }
    let importance = new.importance.unwrap_or(DEFAULT_IMPORTANCE);
    validate_importance(importance)?;

    let id = match new.id {
        Some(id) if id.trim().is_empty() => {
            return Err(MemoryError::validation("block id must not be blank"))
        }
        Some(id) => id,
        None => uuid::Uuid::now_v7().to_string(),
    };
    if new.relationships.iter().any(|r| r.trim().is_empty()) {
        return Err(MemoryError::validation("relationship ids must not be blank"));
    }
    if new.relationships.iter().any(|r| *r == id) {
        return Err(MemoryError::validation("a block cannot reference itself"));
    }

    let label = match new.label {
        Some(label) if !label.trim().is_empty() => label,
        _ => super::truncate_preview(new.content.trim(), 40),
    };
    let created_at = new.created_at.map(stored_precision).unwrap_or_else(now);

    Ok(MemoryBlock {
        id,
        task_id: new.task_id,
        session_id: new.session_id,
        content: new.content,
        block_type: new.block_type.unwrap_or(BlockType::Episodic),
        label,
        importance,
        created_at,
        updated_at: created_at,
        last_accessed: None,
        access_count: 0,
        embedding_model_id: None,
        metadata: new.metadata,
        relationships: new.relationships,
    })
}

pub(crate) fn validate_importance(importance: f64) -> Result<()> {
    if importance.is_finite() && (0.0..=1.0).contains(&importance) {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "importance must be within [0, 1], got {importance}"
        )))
    }
}

fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(MemoryError::validation("embedding must not be empty"));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(MemoryError::validation("embedding contains non-finite values"));
    }
    Ok(())
}

fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|x| *x == 0.0)
}

// ── Transaction helpers ──────────────────────────────────────────────────────

/// Insert a prepared block with its FTS entry, relationships, reference
/// boosts and audit entry.
pub(crate) fn insert_block_in_tx(tx: &Transaction, block: &MemoryBlock, reference_boost: f64) -> Result<()> {
    if let Some(task_id) = &block.task_id {
        super::tasks::ensure_live_task(tx, task_id)?;
    }
    tx.execute(
        "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
        params![block.session_id, format_timestamp(&block.created_at)],
    )?;

    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM blocks WHERE id = ?1",
        params![block.id],
        |row| row.get(0),
    )?;
    if exists {
        return Err(MemoryError::validation(format!("block already exists: {}", block.id)));
    }

    let rowid = insert_block_row(tx, block)?;
    tx.execute(
        "INSERT INTO blocks_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
        params![rowid, block.content, block.id],
    )?;
    insert_relationships(tx, &block.id, &block.relationships)?;
    adjust_referenced_importance(tx, &block.relationships, reference_boost, &block.updated_at)?;

    write_audit_log(
        tx,
        "create",
        &block.id,
        Some(&serde_json::json!({"type": block.block_type.as_str()})),
    )?;
    Ok(())
}

fn insert_block_row(tx: &Transaction, block: &MemoryBlock) -> Result<i64> {
    let metadata_json = if block.metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&block.metadata)?)
    };
    let ts = format_timestamp(&block.created_at);

    tx.execute(
        "INSERT INTO blocks (id, task_id, session_id, content, block_type, label, importance, \
         created_at, updated_at, access_count, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, ?9)",
        params![
            block.id,
            block.task_id,
            block.session_id,
            block.content,
            block.block_type.as_str(),
            block.label,
            block.importance,
            ts,
            metadata_json,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_relationships(tx: &Transaction, block_id: &str, targets: &[String]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO block_relationships (block_id, position, target_id) VALUES (?1, ?2, ?3)",
    )?;
    for (position, target) in targets.iter().enumerate() {
        stmt.execute(params![block_id, position as i64, target])?;
    }
    Ok(())
}

/// Shift the importance of each distinct existing target by `delta`,
/// clamped to `[0, 1]`.
fn adjust_referenced_importance(
    tx: &Transaction,
    targets: &[String],
    delta: f64,
    at: &chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    if delta == 0.0 {
        return Ok(());
    }
    let ts = format_timestamp(at);
    let mut seen = HashSet::new();
    let mut stmt = tx.prepare(
        "UPDATE blocks SET importance = MAX(0.0, MIN(1.0, importance + ?1)), updated_at = ?2 \
         WHERE id = ?3",
    )?;
    for target in targets {
        if seen.insert(target.as_str()) {
            stmt.execute(params![delta, ts, target])?;
        }
    }
    Ok(())
}

fn ensure_block(conn: &Connection, block_id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM blocks WHERE id = ?1",
        params![block_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(MemoryError::not_found("block", block_id))
    }
}

/// Remove a block and everything indexed for it. Shared by explicit deletes,
/// task purges, and compaction eviction (`reason` lands in the audit log).
pub(crate) fn delete_block_in_tx(
    tx: &Transaction,
    block_id: &str,
    reference_boost: f64,
    reason: Option<&str>,
) -> Result<()> {
    let (rowid, content): (i64, String) = tx
        .query_row(
            "SELECT rowid, content FROM blocks WHERE id = ?1",
            params![block_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| MemoryError::not_found("block", block_id))?;

    // External-content FTS5 tables need the special 'delete' command
    tx.execute(
        "INSERT INTO blocks_fts(blocks_fts, rowid, content, id) VALUES('delete', ?1, ?2, ?3)",
        params![rowid, content, block_id],
    )?;

    let targets = load_relationships(tx, block_id)?;
    adjust_referenced_importance(tx, &targets, -reference_boost, &now())?;

    tx.execute("DELETE FROM embeddings WHERE block_id = ?1", params![block_id])?;
    tx.execute(
        "DELETE FROM block_relationships WHERE block_id = ?1",
        params![block_id],
    )?;
    write_audit_log(
        tx,
        "delete",
        block_id,
        reason.map(|r| serde_json::json!({"reason": r})).as_ref(),
    )?;
    tx.execute("DELETE FROM blocks WHERE id = ?1", params![block_id])?;
    Ok(())
}

/// Write an entry to the block_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    block_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let ts = format_timestamp(&now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO block_log (operation, block_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, block_id, details_json, ts],
    )?;
    Ok(())
}

// ── Row mapping ──────────────────────────────────────────────────────────────

/// Map a row selected with [`BLOCK_COLUMNS`]. Relationships are left empty.
pub(crate) fn row_to_block(row: &Row<'_>) -> rusqlite::Result<MemoryBlock> {
    let block_type: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let last_accessed: Option<String> = row.get(9)?;
    let metadata: Option<String> = row.get(12)?;

    Ok(MemoryBlock {
        id: row.get(0)?,
        task_id: row.get(1)?,
        session_id: row.get(2)?,
        content: row.get(3)?,
        block_type: block_type.parse().map_err(|e: MemoryError| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        label: row.get(5)?,
        importance: row.get(6)?,
        created_at: parse_timestamp(7, &created_at)?,
        updated_at: parse_timestamp(8, &updated_at)?,
        last_accessed: last_accessed.as_deref().map(|s| parse_timestamp(9, s)).transpose()?,
        access_count: row.get(10)?,
        embedding_model_id: row.get(11)?,
        metadata: metadata
            .and_then(|s| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&s).ok())
            .unwrap_or_default(),
        relationships: Vec::new(),
    })
}

pub(crate) fn load_relationships(conn: &Connection, block_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT target_id FROM block_relationships WHERE block_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map(params![block_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

pub(crate) fn fetch_block(conn: &Connection, block_id: &str) -> Result<Option<MemoryBlock>> {
    let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.id = ?1");
    let block = conn
        .query_row(&sql, params![block_id], row_to_block)
        .optional()?;
    match block {
        Some(mut block) => {
            block.relationships = load_relationships(conn, &block.id)?;
            Ok(Some(block))
        }
        None => Ok(None),
    }
}

pub(crate) fn query_blocks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<MemoryBlock>> {
    let mut stmt = conn.prepare(sql)?;
    let mut blocks = stmt
        .query_map(params, row_to_block)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for block in &mut blocks {
        block.relationships = load_relationships(conn, &block.id)?;
    }
    Ok(blocks)
}

fn with_relationships(
    conn: &Connection,
    mut rows: Vec<(MemoryBlock, f64)>,
) -> Result<Vec<(MemoryBlock, f64)>> {
    for (block, _) in &mut rows {
        block.relationships = load_relationships(conn, &block.id)?;
    }
    Ok(rows)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word becomes a quoted string and the words are
/// OR-ed, so BM25 ranks partial matches instead of requiring every term.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn poisoned() -> MemoryError {
    MemoryError::Storage {
        message: "connection lock poisoned".into(),
        retryable: false,
    }
}

fn bootstrap_err(err: anyhow::Error) -> MemoryError {
    MemoryError::Storage {
        message: format!("{err:#}"),
        retryable: false,
    }
}
