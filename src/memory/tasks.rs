//! Task and session hierarchy.
//!
//! Tasks form a parent/child tree and own blocks. Deleting a task is a soft
//! delete by default: the task is hidden and its blocks are orphaned (their
//! `task_id` cleared) rather than erased. A purge deletes the task's blocks
//! with all their indices.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::store::{delete_block_in_tx, query_blocks, write_audit_log, MemoryStore, BLOCK_COLUMNS};
use super::types::{MemoryBlock, NewTask, SessionRecord, TaskContext, TaskStatus};
use super::{format_timestamp, now, parse_timestamp};
use crate::error::{MemoryError, Result};

/// What `delete_task` did.
#[derive(Debug, Serialize)]
pub struct DeleteTaskResult {
    pub id: String,
    pub purged: bool,
    /// Blocks orphaned (soft delete) or erased (purge).
    pub blocks_affected: usize,
}

impl MemoryStore {
    pub fn create_task(&self, new: NewTask) -> Result<TaskContext> {
        if new.title.trim().is_empty() {
            return Err(MemoryError::validation("task title must not be empty"));
        }
        let task = TaskContext {
            id: new.id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
            parent_id: new.parent_id,
            title: new.title,
            status: new.status,
            created_at: now(),
            deleted_at: None,
        };

        self.write(|tx| {
            if let Some(parent) = &task.parent_id {
                ensure_live_task(tx, parent)?;
            }
            let exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                params![task.id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(MemoryError::validation(format!("task already exists: {}", task.id)));
            }
            tx.execute(
                "INSERT INTO tasks (id, parent_id, title, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.id,
                    task.parent_id,
                    task.title,
                    task.status.as_str(),
                    format_timestamp(&task.created_at)
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(id = %task.id, "task created");
        Ok(task)
    }

    /// Look up a live (not soft-deleted) task.
    pub fn get_task(&self, task_id: &str) -> Result<TaskContext> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, parent_id, title, status, created_at, deleted_at FROM tasks \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![task_id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| MemoryError::not_found("task", task_id))
        })
    }

    /// Live direct children of a task, oldest first.
    pub fn list_subtasks(&self, task_id: &str) -> Result<Vec<TaskContext>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_id, title, status, created_at, deleted_at FROM tasks \
                 WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
            )?;
            let tasks = stmt
                .query_map(params![task_id], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![status.as_str(), task_id],
            )?;
            if rows == 0 {
                return Err(MemoryError::not_found("task", task_id));
            }
            Ok(())
        })
    }

    /// Soft-delete a task (orphaning its blocks and children), or purge it
    /// together with its blocks.
    pub fn delete_task(&self, task_id: &str, purge: bool) -> Result<DeleteTaskResult> {
        let boost = self.reference_boost();
        let blocks_affected = self.write(|tx| {
            let exists: bool = tx.query_row(
                "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(MemoryError::not_found("task", task_id));
            }

            tx.execute(
                "UPDATE tasks SET parent_id = NULL WHERE parent_id = ?1",
                params![task_id],
            )?;

            if purge {
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare("SELECT id FROM blocks WHERE task_id = ?1")?;
                    let ids = stmt
                        .query_map(params![task_id], |row| row.get(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    ids
                };
                for id in &ids {
                    delete_block_in_tx(tx, id, boost, Some("task purged"))?;
                }
                tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
                Ok(ids.len())
            } else {
                let ts = format_timestamp(&now());
                let orphaned = tx.execute(
                    "UPDATE blocks SET task_id = NULL, updated_at = ?1 WHERE task_id = ?2",
                    params![ts, task_id],
                )?;
                tx.execute(
                    "UPDATE tasks SET deleted_at = ?1 WHERE id = ?2",
                    params![ts, task_id],
                )?;
                write_audit_log(
                    tx,
                    "update",
                    task_id,
                    Some(&serde_json::json!({"task_deleted": true, "orphaned": orphaned})),
                )?;
                Ok(orphaned)
            }
        })?;

        tracing::info!(id = %task_id, purge, blocks_affected, "task deleted");
        Ok(DeleteTaskResult {
            id: task_id.to_string(),
            purged: purge,
            blocks_affected,
        })
    }

    /// Blocks that lost their task through a soft delete.
    pub fn orphaned_blocks(&self, limit: usize) -> Result<Vec<MemoryBlock>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.task_id IS NULL \
                 ORDER BY b.importance DESC, b.created_at DESC, b.id ASC LIMIT ?1"
            );
            query_blocks(conn, &sql, params![limit as i64])
        })
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Register a session. Starting an already-known session returns it
    /// unchanged.
    pub fn start_session(&self, session_id: &str, platform: Option<&str>) -> Result<SessionRecord> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::validation("session id must not be empty"));
        }
        let ts = format_timestamp(&now());
        self.write(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO sessions (id, started_at, platform) VALUES (?1, ?2, ?3)",
                params![session_id, ts, platform],
            )?;
            Ok(())
        })?;
        self.get_session(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, started_at, ended_at, platform, summary FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?
            .ok_or_else(|| MemoryError::not_found("session", session_id))
        })
    }

    /// Close a session, recording the compactor's summary.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<SessionRecord> {
        let ts = format_timestamp(&now());
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE sessions SET ended_at = ?1, summary = COALESCE(?2, summary) WHERE id = ?3",
                params![ts, summary, session_id],
            )?;
            if rows == 0 {
                return Err(MemoryError::not_found("session", session_id));
            }
            Ok(())
        })?;
        self.get_session(session_id)
    }
}

/// Fail with `NotFound` unless `task_id` names a live task.
pub(crate) fn ensure_live_task(conn: &Connection, task_id: &str) -> Result<()> {
    let live: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1 AND deleted_at IS NULL",
        params![task_id],
        |row| row.get(0),
    )?;
    if live {
        Ok(())
    } else {
        Err(MemoryError::not_found("task", task_id))
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskContext> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let deleted_at: Option<String> = row.get(5)?;
    Ok(TaskContext {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        status: status.parse().map_err(|e: MemoryError| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_timestamp(4, &created_at)?,
        deleted_at: deleted_at.as_deref().map(|s| parse_timestamp(5, s)).transpose()?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let started_at: String = row.get(1)?;
    let ended_at: Option<String> = row.get(2)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        started_at: parse_timestamp(1, &started_at)?,
        ended_at: ended_at.as_deref().map(|s| parse_timestamp(2, s)).transpose()?,
        platform: row.get(3)?,
        summary: row.get(4)?,
    })
}
