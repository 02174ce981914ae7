//! Transactional projection writer.
//!
//! All projection mutations run inside a caller-supplied [`WriteScope`] and
//! follow the same shape: consult the FTS capability snapshot, normalize
//! the searchable fields, log a write-ahead entry, apply the row mutation,
//! refresh the FTS and trigram companions, then clear the journal entry in
//! the same transaction.
//!
//! The guarded upsert is optimistic: it only updates when the stored hashes
//! match the expected ones (or are null). A zero-row result is
//! disambiguated by re-reading the row — if every observable column already
//! equals the intended values the stored hashes alone drifted
//! (`AnalyzerOrContentDrift`, the coordinator force-replaces); otherwise a
//! concurrent writer won (`StaleProjectionUpdate`, the caller refreshes its
//! expected hashes and retries).

use std::sync::Arc;

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection};
use tracing::{debug, warn};

use crate::analyzer::Analyzer;
use crate::capability::FtsCapability;
use crate::config::{RetryConfig, TrigramConfig, TrigramField};
use crate::error::{self, IndexError, Result};
use crate::journal::{self, JournalOp};
use crate::model::{FileDocument, FileId};
use crate::query::trigram::trigram_set;
use crate::scope::{ScopeGuard, WriteScope};
use crate::signature::hex_sha256;
use crate::store::Clock;

/// What a projection write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row and its FTS companions were written.
    Applied,
    /// The FTS schema is unavailable; the write degraded to a no-op.
    Skipped,
}

const UPSERT_GUARDED_SQL: &str = "\
INSERT INTO search_document \
 (file_id, title, author, mime, metadata_text, metadata_json, size_bytes, \
  created_utc, modified_utc, content_hash, stored_content_hash, stored_token_hash) \
 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
 ON CONFLICT(file_id) DO UPDATE SET \
  title = excluded.title, \
  author = excluded.author, \
  mime = excluded.mime, \
  metadata_text = excluded.metadata_text, \
  metadata_json = excluded.metadata_json, \
  size_bytes = excluded.size_bytes, \
  created_utc = excluded.created_utc, \
  modified_utc = excluded.modified_utc, \
  content_hash = excluded.content_hash, \
  stored_content_hash = excluded.stored_content_hash, \
  stored_token_hash = excluded.stored_token_hash \
 WHERE (search_document.stored_content_hash IS NULL OR search_document.stored_content_hash IS ?) \
   AND (search_document.stored_token_hash IS NULL OR search_document.stored_token_hash IS ?)";

const UPSERT_FORCE_SQL: &str = "\
INSERT INTO search_document \
 (file_id, title, author, mime, metadata_text, metadata_json, size_bytes, \
  created_utc, modified_utc, content_hash, stored_content_hash, stored_token_hash) \
 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
 ON CONFLICT(file_id) DO UPDATE SET \
  title = excluded.title, \
  author = excluded.author, \
  mime = excluded.mime, \
  metadata_text = excluded.metadata_text, \
  metadata_json = excluded.metadata_json, \
  size_bytes = excluded.size_bytes, \
  created_utc = excluded.created_utc, \
  modified_utc = excluded.modified_utc, \
  content_hash = excluded.content_hash, \
  stored_content_hash = excluded.stored_content_hash, \
  stored_token_hash = excluded.stored_token_hash";

pub struct ProjectionWriter {
    capability: Arc<FtsCapability>,
    analyzer: Arc<Analyzer>,
    retry: RetryConfig,
    trigram: TrigramConfig,
    clock: Arc<dyn Clock>,
}

struct NormalizedFields {
    title: String,
    author: Option<String>,
    metadata_text: Option<String>,
}

impl ProjectionWriter {
    pub fn new(
        capability: Arc<FtsCapability>,
        analyzer: Arc<Analyzer>,
        retry: RetryConfig,
        trigram: TrigramConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            capability,
            analyzer,
            retry,
            trigram,
            clock,
        }
    }

    /// Optimistically guarded insert-or-update of the projection row.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        scope: &mut WriteScope,
        guard: &ScopeGuard,
        file: &FileDocument,
        expected_content_hash: Option<&str>,
        expected_token_hash: Option<&str>,
        new_content_hash: &str,
        new_token_hash: Option<&str>,
    ) -> Result<WriteOutcome> {
        self.apply(
            scope,
            guard,
            file,
            Some((expected_content_hash, expected_token_hash)),
            new_content_hash,
            new_token_hash,
        )
        .await
    }

    /// Unconditional upsert, used after drift detection and during journal
    /// replay.
    pub async fn force_replace(
        &self,
        scope: &mut WriteScope,
        guard: &ScopeGuard,
        file: &FileDocument,
        new_content_hash: &str,
        new_token_hash: Option<&str>,
    ) -> Result<WriteOutcome> {
        self.apply(scope, guard, file, None, new_content_hash, new_token_hash)
            .await
    }

    async fn apply(
        &self,
        scope: &mut WriteScope,
        guard: &ScopeGuard,
        file: &FileDocument,
        expected: Option<(Option<&str>, Option<&str>)>,
        new_content_hash: &str,
        new_token_hash: Option<&str>,
    ) -> Result<WriteOutcome> {
        if !self.capability.is_available() {
            debug!(
                reason = self.capability.reason().unwrap_or("unknown"),
                "full-text schema unavailable, skipping projection write"
            );
            return Ok(WriteOutcome::Skipped);
        }

        let fields = self.normalize_fields(file);
        let title_hash = hex_sha256(fields.title.as_bytes());
        let now = self.clock.utc_now();

        let conn = scope.connection(guard)?;
        let entry = journal::log(
            conn,
            now,
            file.id,
            JournalOp::Index,
            Some(new_content_hash),
            Some(&title_hash),
        )
        .await?;

        let file_id = file.id.to_string();
        let created_utc = crate::model::format_utc(file.created_utc);
        let modified_utc = crate::model::format_utc(file.modified_utc);

        let result = match expected {
            Some((expected_content, expected_token)) => {
                execute_with_retry(conn, &self.retry, "projection upsert", || {
                    sqlx::query(UPSERT_GUARDED_SQL)
                        .bind(&file_id)
                        .bind(&fields.title)
                        .bind(&fields.author)
                        .bind(&file.mime)
                        .bind(&fields.metadata_text)
                        .bind(&file.metadata_json)
                        .bind(file.size_bytes)
                        .bind(&created_utc)
                        .bind(&modified_utc)
                        .bind(new_content_hash)
                        .bind(new_content_hash)
                        .bind(new_token_hash)
                        .bind(expected_content)
                        .bind(expected_token)
                })
                .await?
            }
            None => {
                execute_with_retry(conn, &self.retry, "projection replace", || {
                    sqlx::query(UPSERT_FORCE_SQL)
                        .bind(&file_id)
                        .bind(&fields.title)
                        .bind(&fields.author)
                        .bind(&file.mime)
                        .bind(&fields.metadata_text)
                        .bind(&file.metadata_json)
                        .bind(file.size_bytes)
                        .bind(&created_utc)
                        .bind(&modified_utc)
                        .bind(new_content_hash)
                        .bind(new_content_hash)
                        .bind(new_token_hash)
                })
                .await?
            }
        };

        if result.rows_affected() == 0 {
            // Do not leave the failed attempt's journal entry behind: the
            // caller may continue this transaction with a force replace.
            if let Some(id) = entry {
                journal::clear(conn, id).await?;
            }
            return Err(self
                .classify_zero_rows(conn, file, &fields, new_content_hash)
                .await?);
        }

        self.refresh_fts(conn, &file_id, &fields, &file.mime, file.metadata_json.as_deref())
            .await?;
        self.refresh_trigram(conn, &file_id, file, &fields).await?;

        if let Some(id) = entry {
            journal::clear(conn, id).await?;
        }
        Ok(WriteOutcome::Applied)
    }

    /// Removes the projection row and its FTS companions.
    pub async fn delete(
        &self,
        scope: &mut WriteScope,
        guard: &ScopeGuard,
        file_id: FileId,
    ) -> Result<u64> {
        if !self.capability.is_available() {
            debug!(
                reason = self.capability.reason().unwrap_or("unknown"),
                "full-text schema unavailable, skipping projection delete"
            );
            return Ok(0);
        }

        let now = self.clock.utc_now();
        let conn = scope.connection(guard)?;
        let entry = journal::log(conn, now, file_id, JournalOp::Delete, None, None).await?;

        let id_text = file_id.to_string();
        let result = execute_with_retry(conn, &self.retry, "projection delete", || {
            sqlx::query("DELETE FROM search_document WHERE file_id = ?").bind(&id_text)
        })
        .await?;

        remove_fts_row(conn, "search_document_fts", "file_search_map", &id_text).await?;
        remove_fts_row(conn, "file_trgm", "file_trgm_map", &id_text).await?;

        if let Some(id) = entry {
            journal::clear(conn, id).await?;
        }
        Ok(result.rows_affected())
    }

    fn normalize_fields(&self, file: &FileDocument) -> NormalizedFields {
        NormalizedFields {
            title: self.analyzer.normalize(&file.title),
            author: file.author.as_deref().map(|a| self.analyzer.normalize(a)),
            metadata_text: file
                .metadata_text
                .as_deref()
                .map(|m| self.analyzer.normalize(m)),
        }
    }

    /// Decides which error a zero-row guarded upsert means.
    async fn classify_zero_rows(
        &self,
        conn: &mut SqliteConnection,
        file: &FileDocument,
        fields: &NormalizedFields,
        new_content_hash: &str,
    ) -> Result<IndexError> {
        let row: Option<SqliteRow> = sqlx::query(
            "SELECT title, author, mime, metadata_text, metadata_json, content_hash \
             FROM search_document WHERE file_id = ?",
        )
        .bind(file.id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(IndexError::StaleProjectionUpdate(file.id));
        };

        let matches = row.get::<Option<String>, _>("title").as_deref() == Some(fields.title.as_str())
            && row.get::<Option<String>, _>("author").as_deref() == fields.author.as_deref()
            && row.get::<String, _>("mime") == file.mime
            && row.get::<Option<String>, _>("metadata_text").as_deref()
                == fields.metadata_text.as_deref()
            && row.get::<Option<String>, _>("metadata_json").as_deref()
                == file.metadata_json.as_deref()
            && row.get::<String, _>("content_hash") == new_content_hash;

        if matches {
            Ok(IndexError::AnalyzerOrContentDrift(file.id))
        } else {
            Ok(IndexError::StaleProjectionUpdate(file.id))
        }
    }

    /// Replaces the document's row in the lexical FTS table, keeping the
    /// rowid map current.
    async fn refresh_fts(
        &self,
        conn: &mut SqliteConnection,
        file_id: &str,
        fields: &NormalizedFields,
        mime: &str,
        metadata_json: Option<&str>,
    ) -> Result<()> {
        remove_fts_row(conn, "search_document_fts", "file_search_map", file_id).await?;

        sqlx::query(
            "INSERT INTO search_document_fts (title, mime, author, metadata_text, metadata_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&fields.title)
        .bind(mime)
        .bind(&fields.author)
        .bind(&fields.metadata_text)
        .bind(metadata_json)
        .execute(&mut *conn)
        .await?;

        let rowid: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
            .fetch_one(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO file_search_map (file_id, fts_rowid) VALUES (?, ?)")
            .bind(file_id)
            .bind(rowid)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Replaces the document's trigram row from the configured fields.
    async fn refresh_trigram(
        &self,
        conn: &mut SqliteConnection,
        file_id: &str,
        file: &FileDocument,
        fields: &NormalizedFields,
    ) -> Result<()> {
        remove_fts_row(conn, "file_trgm", "file_trgm_map", file_id).await?;

        let mut grams = std::collections::BTreeSet::new();
        for field in &self.trigram.fields {
            let text = match field {
                TrigramField::Title => Some(fields.title.clone()),
                TrigramField::Author => fields.author.clone(),
                TrigramField::Filename => Some(self.analyzer.normalize(&file.name)),
                TrigramField::MetadataText => fields.metadata_text.clone(),
            };
            if let Some(text) = text {
                grams.extend(trigram_set(&text));
            }
        }
        if grams.is_empty() {
            return Ok(());
        }

        let trgm_text = grams.into_iter().collect::<Vec<_>>().join(" ");
        sqlx::query("INSERT INTO file_trgm (trgm) VALUES (?)")
            .bind(&trgm_text)
            .execute(&mut *conn)
            .await?;
        let rowid: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
            .fetch_one(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO file_trgm_map (file_id, fts_rowid) VALUES (?, ?)")
            .bind(file_id)
            .bind(rowid)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Deletes the mapped FTS row and its map entry, if present.
async fn remove_fts_row(
    conn: &mut SqliteConnection,
    fts_table: &str,
    map_table: &str,
    file_id: &str,
) -> Result<()> {
    let rowid: Option<i64> =
        sqlx::query_scalar(&format!("SELECT fts_rowid FROM {map_table} WHERE file_id = ?"))
            .bind(file_id)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(rowid) = rowid {
        sqlx::query(&format!("DELETE FROM {fts_table} WHERE rowid = ?"))
            .bind(rowid)
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("DELETE FROM {map_table} WHERE file_id = ?"))
            .bind(file_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Runs a statement with the busy-retry policy: transient busy/locked
/// errors back off exponentially (25 → 400 ms by default) and are retried
/// up to the attempt budget; anything else propagates immediately.
async fn execute_with_retry<'q, F>(
    conn: &mut SqliteConnection,
    retry: &RetryConfig,
    operation: &'static str,
    mut build: F,
) -> Result<SqliteQueryResult>
where
    F: FnMut() -> Query<'q, Sqlite, SqliteArguments<'q>>,
{
    let mut attempt: u32 = 0;
    loop {
        match build().execute(&mut *conn).await {
            Ok(result) => return Ok(result),
            Err(err) if error::is_busy(&err) => {
                attempt += 1;
                if attempt >= retry.max_attempts {
                    warn!(operation, attempts = attempt, "storage busy, retry budget exhausted");
                    return Err(IndexError::StorageBusy { attempts: attempt });
                }
                let delay = retry.delay_for(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "storage busy, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
