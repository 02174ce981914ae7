//! Write-ahead journal for projection operations.
//!
//! Every projection mutation logs an entry before touching the FTS tables
//! and clears it in the same transaction after the mutation succeeds. On
//! startup, pending entries are replayed: `index` entries reconstruct the
//! file from the aggregate and force-replace the projection, `delete`
//! entries remove it. Poison entries (unparseable file id, unknown op,
//! missing file, repeated replay failure) move to the dead-letter queue
//! with a reason string.
//!
//! Replay runs under a task-local suppression scope so the projection
//! writer does not re-log the entry currently being replayed. The scope is
//! task-local, not thread-static: concurrent writers on other tasks keep
//! journaling normally.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::ConnectionPool;
use crate::error::Result;
use crate::model::FileId;
use crate::scope::WriteScope;
use crate::signature::SignatureCalculator;
use crate::store::{Clock, FileStore};
use crate::writer::ProjectionWriter;

tokio::task_local! {
    static SUPPRESSION_DEPTH: usize;
}

/// True when the current task is replaying and journal writes must not
/// re-enter.
pub fn is_suppressed() -> bool {
    SUPPRESSION_DEPTH.try_with(|depth| *depth > 0).unwrap_or(false)
}

/// Runs `fut` with journal logging suppressed. Nests; the depth is restored
/// on every exit path including panics and cancellation.
pub async fn suppressed<F: Future>(fut: F) -> F::Output {
    let depth = SUPPRESSION_DEPTH.try_with(|d| *d).unwrap_or(0);
    SUPPRESSION_DEPTH.scope(depth + 1, fut).await
}

/// Journal operations. Anything else found in the table is poison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Index,
    Delete,
}

impl JournalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalOp::Index => "index",
            JournalOp::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "index" => Some(JournalOp::Index),
            "delete" => Some(JournalOp::Delete),
            _ => None,
        }
    }
}

/// A pending journal row, exactly as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JournalEntry {
    pub id: i64,
    pub file_id: String,
    pub op: String,
    pub content_hash: Option<String>,
    pub title_hash: Option<String>,
    pub enqueued_utc: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterEntry {
    pub original_id: i64,
    pub file_id: String,
    pub op: String,
    pub content_hash: Option<String>,
    pub title_hash: Option<String>,
    pub enqueued_utc: String,
    pub dead_lettered_utc: String,
    pub error: String,
}

/// Writes a journal entry inside the caller's transaction. Returns `None`
/// when the current task is replaying (suppressed).
pub async fn log(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    file_id: FileId,
    op: JournalOp,
    content_hash: Option<&str>,
    title_hash: Option<&str>,
) -> Result<Option<i64>> {
    if is_suppressed() {
        return Ok(None);
    }
    let result = sqlx::query(
        "INSERT INTO fts_write_ahead (file_id, op, content_hash, title_hash, enqueued_utc) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(file_id.to_string())
    .bind(op.as_str())
    .bind(content_hash)
    .bind(title_hash)
    .bind(crate::model::format_utc(now))
    .execute(&mut *conn)
    .await?;
    Ok(Some(result.last_insert_rowid()))
}

/// Deletes a journal entry; intended to run in the same transaction as the
/// projection mutation it covers.
pub async fn clear(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM fts_write_ahead WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn pending(pool: &SqlitePool) -> Result<Vec<JournalEntry>> {
    Ok(sqlx::query_as::<_, JournalEntry>(
        "SELECT id, file_id, op, content_hash, title_hash, enqueued_utc \
         FROM fts_write_ahead ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn dead_letters(pool: &SqlitePool) -> Result<Vec<DeadLetterEntry>> {
    Ok(sqlx::query_as::<_, DeadLetterEntry>(
        "SELECT original_id, file_id, op, content_hash, title_hash, enqueued_utc, \
                dead_lettered_utc, error \
         FROM fts_write_ahead_dlq ORDER BY original_id ASC",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn dlq_depth(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM fts_write_ahead_dlq")
        .fetch_one(pool)
        .await?)
}

/// Clears the dead-letter queue. Operator action only.
pub async fn purge_dead_letters(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM fts_write_ahead_dlq")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: u32,
    pub dead_lettered: u32,
}

pub struct WriteAheadJournal {
    pool: Arc<ConnectionPool>,
    writer: Arc<ProjectionWriter>,
    signer: Arc<SignatureCalculator>,
    clock: Arc<dyn Clock>,
}

impl WriteAheadJournal {
    pub fn new(
        pool: Arc<ConnectionPool>,
        writer: Arc<ProjectionWriter>,
        signer: Arc<SignatureCalculator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            writer,
            signer,
            clock,
        }
    }

    /// Replays all pending entries in submission order. Each entry is
    /// processed in its own transaction; a failed entry rolls back its
    /// projection change and moves to the DLQ in a separate transaction.
    /// Cancellation stops at the current entry boundary.
    pub async fn replay_pending(
        &self,
        store: &dyn FileStore,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport> {
        let handle = self.pool.handle().await;
        let entries = pending(&handle).await?;
        let mut report = ReplayReport::default();

        for entry in entries {
            if cancel.is_cancelled() {
                debug!(replayed = report.replayed, "journal replay canceled at entry boundary");
                break;
            }

            let file_id = match Uuid::parse_str(&entry.file_id) {
                Ok(id) => id,
                Err(_) => {
                    self.dead_letter(&handle, &entry, "Invalid file identifier")
                        .await?;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            let op = match JournalOp::parse(&entry.op) {
                Some(op) => op,
                None => {
                    let reason = format!("Unknown journal operation: {}", entry.op);
                    self.dead_letter(&handle, &entry, &reason).await?;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            match self.replay_entry(&handle, store, &entry, file_id, op).await {
                Ok(true) => report.replayed += 1,
                Ok(false) => report.dead_lettered += 1,
                Err(err) => {
                    self.dead_letter(&handle, &entry, &err.to_string()).await?;
                    report.dead_lettered += 1;
                }
            }
        }

        Ok(report)
    }

    /// Replays one entry in its own transaction. Returns `Ok(false)` when
    /// the entry was dead-lettered without an error (missing file).
    async fn replay_entry(
        &self,
        handle: &SqlitePool,
        store: &dyn FileStore,
        entry: &JournalEntry,
        file_id: FileId,
        op: JournalOp,
    ) -> Result<bool> {
        match op {
            JournalOp::Index => {
                let Some(file) = store.get(file_id).await? else {
                    self.dead_letter(handle, entry, "File not found in aggregate store")
                        .await?;
                    return Ok(false);
                };
                let signature = self.signer.compute(&file)?;

                let mut scope = WriteScope::begin(handle).await?;
                let guard = scope.guard();
                let outcome = suppressed(async {
                    self.writer
                        .force_replace(
                            &mut scope,
                            &guard,
                            &file,
                            &file.content.hash,
                            signature.token_hash.as_deref(),
                        )
                        .await?;
                    clear(scope.connection(&guard)?, entry.id).await
                })
                .await;

                match outcome {
                    Ok(()) => {
                        scope.commit().await?;
                        Ok(true)
                    }
                    Err(err) => {
                        // Drop rolls the projection change back; the entry
                        // dead-letters in its own transaction.
                        drop(scope);
                        warn!(entry = entry.id, error = %err, "journal replay failed");
                        Err(err)
                    }
                }
            }
            JournalOp::Delete => {
                let mut scope = WriteScope::begin(handle).await?;
                let guard = scope.guard();
                let outcome = suppressed(async {
                    self.writer.delete(&mut scope, &guard, file_id).await?;
                    clear(scope.connection(&guard)?, entry.id).await
                })
                .await;

                match outcome {
                    Ok(()) => {
                        scope.commit().await?;
                        Ok(true)
                    }
                    Err(err) => {
                        drop(scope);
                        warn!(entry = entry.id, error = %err, "journal replay failed");
                        Err(err)
                    }
                }
            }
        }
    }

    /// Atomic insert-into-DLQ + delete-from-journal.
    async fn dead_letter(
        &self,
        handle: &SqlitePool,
        entry: &JournalEntry,
        error: &str,
    ) -> Result<()> {
        warn!(entry = entry.id, error, "moving journal entry to dead-letter queue");
        let mut tx = handle.begin().await?;
        sqlx::query(
            "INSERT INTO fts_write_ahead_dlq \
             (original_id, file_id, op, content_hash, title_hash, enqueued_utc, \
              dead_lettered_utc, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id)
        .bind(&entry.file_id)
        .bind(&entry.op)
        .bind(&entry.content_hash)
        .bind(&entry.title_hash)
        .bind(&entry.enqueued_utc)
        .bind(crate::model::format_utc(self.clock.utc_now()))
        .bind(error)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM fts_write_ahead WHERE id = ?")
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn suppression_is_scoped_and_nested() {
        assert!(!is_suppressed());
        suppressed(async {
            assert!(is_suppressed());
            suppressed(async {
                assert!(is_suppressed());
            })
            .await;
            assert!(is_suppressed());
        })
        .await;
        assert!(!is_suppressed());
    }

    #[tokio::test]
    async fn suppression_does_not_leak_across_tasks() {
        let handle = tokio::spawn(suppressed(async {
            assert!(is_suppressed());
            // Another task spawned while this one is suppressed sees a
            // clean depth.
            tokio::spawn(async { is_suppressed() }).await.unwrap()
        }));
        assert!(!handle.await.unwrap());
    }

    #[test]
    fn op_round_trips() {
        assert_eq!(JournalOp::parse("index"), Some(JournalOp::Index));
        assert_eq!(JournalOp::parse("delete"), Some(JournalOp::Delete));
        assert_eq!(JournalOp::parse("compact"), None);
    }
}
