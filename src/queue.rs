//! Reindex queue persistence.
//!
//! Entries are created by the coordinator (deferred indexing, drift
//! repairs, integrity audits, external requests), picked up by the
//! background processor in `(enqueued_utc, id)` order, and marked
//! processed or retried. Retry counts grow monotonically until the drop
//! policy converts an entry into an operator-visible record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::db::ConnectionPool;
use crate::error::Result;
use crate::model::{format_utc, FileId, ReindexReason};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub file_id: String,
    pub reason: String,
    pub enqueued_utc: String,
    pub processed_utc: Option<String>,
    pub retry_count: i64,
}

/// How the processor settles an entry after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Success, no-change, not-found or policy drop: mark processed.
    Processed,
    /// Transient failure: bump the retry count and leave for the next
    /// iteration.
    Retry,
}

pub struct ReindexQueue {
    pool: Arc<ConnectionPool>,
}

impl ReindexQueue {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        file_id: FileId,
        reason: ReindexReason,
        requested_utc: DateTime<Utc>,
    ) -> Result<i64> {
        let handle = self.pool.handle().await;
        let result = sqlx::query(
            "INSERT INTO reindex_queue (file_id, reason, enqueued_utc, retry_count) \
             VALUES (?, ?, ?, 0)",
        )
        .bind(file_id.to_string())
        .bind(reason.as_str())
        .bind(format_utc(requested_utc))
        .execute(&handle)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Enqueue on an existing connection so the intent commits together
    /// with the aggregate change.
    pub async fn enqueue_on(
        conn: &mut SqliteConnection,
        file_id: FileId,
        reason: ReindexReason,
        requested_utc: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO reindex_queue (file_id, reason, enqueued_utc, retry_count) \
             VALUES (?, ?, ?, 0)",
        )
        .bind(file_id.to_string())
        .bind(reason.as_str())
        .bind(format_utc(requested_utc))
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest unprocessed entries, submission order.
    pub async fn next_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let handle = self.pool.handle().await;
        Ok(sqlx::query_as::<_, QueueEntry>(
            "SELECT id, file_id, reason, enqueued_utc, processed_utc, retry_count \
             FROM reindex_queue \
             WHERE processed_utc IS NULL \
             ORDER BY enqueued_utc ASC, id ASC \
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&handle)
        .await?)
    }

    /// Applies a batch of outcomes in a single transaction — the
    /// processor's one save per iteration.
    pub async fn apply_outcomes(
        &self,
        outcomes: &[(i64, EntryOutcome)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let handle = self.pool.handle().await;
        let mut tx = handle.begin().await?;
        let processed_at = format_utc(now);
        for (id, outcome) in outcomes {
            match outcome {
                EntryOutcome::Processed => {
                    sqlx::query("UPDATE reindex_queue SET processed_utc = ? WHERE id = ?")
                        .bind(&processed_at)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                EntryOutcome::Retry => {
                    sqlx::query(
                        "UPDATE reindex_queue SET retry_count = retry_count + 1 WHERE id = ?",
                    )
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let handle = self.pool.handle().await;
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM reindex_queue WHERE processed_utc IS NULL")
                .fetch_one(&handle)
                .await?,
        )
    }

    /// Removes processed entries older than the given cutoff.
    pub async fn compact(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let handle = self.pool.handle().await;
        let result = sqlx::query(
            "DELETE FROM reindex_queue WHERE processed_utc IS NOT NULL AND processed_utc < ?",
        )
        .bind(format_utc(older_than))
        .execute(&handle)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema;
    use uuid::Uuid;

    async fn queue() -> (tempfile::TempDir, ReindexQueue) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("index.sqlite"));
        let pool = Arc::new(ConnectionPool::open(&config).await.unwrap());
        schema::migrate(&pool.handle().await).await.unwrap();
        (tmp, ReindexQueue::new(pool))
    }

    #[tokio::test]
    async fn batch_respects_submission_order() {
        let (_tmp, queue) = queue().await;
        let t0 = Utc::now();
        let a = queue
            .enqueue(Uuid::new_v4(), ReindexReason::ContentChanged, t0)
            .await
            .unwrap();
        let b = queue
            .enqueue(Uuid::new_v4(), ReindexReason::ExternalRequest, t0)
            .await
            .unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(batch[0].reason, "content-changed");
    }

    #[tokio::test]
    async fn outcomes_mark_and_retry() {
        let (_tmp, queue) = queue().await;
        let now = Utc::now();
        let a = queue
            .enqueue(Uuid::new_v4(), ReindexReason::ContentChanged, now)
            .await
            .unwrap();
        let b = queue
            .enqueue(Uuid::new_v4(), ReindexReason::ContentChanged, now)
            .await
            .unwrap();

        queue
            .apply_outcomes(
                &[(a, EntryOutcome::Processed), (b, EntryOutcome::Retry)],
                now,
            )
            .await
            .unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, b);
        assert_eq!(batch[0].retry_count, 1);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }
}
