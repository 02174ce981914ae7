//! Index coordination: immediate vs deferred indexing and the reindex
//! algorithm.
//!
//! In `SameTransaction` mode the projection commits alongside the
//! aggregate change; in `Deferred` mode the mutation only records a
//! reindex intent and the background processor repairs the projection
//! later. `reindex` is the repair path: compute the current signature,
//! attempt a guarded upsert against the stored hashes, fall back to a
//! force replace on drift, then confirm on the aggregate and commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::IndexingMode;
use crate::db::ConnectionPool;
use crate::error::{IndexError, Result};
use crate::model::{FileId, IndexUpdateResult, ReindexReason, SearchIndexState};
use crate::queue::ReindexQueue;
use crate::schema::CURRENT_SCHEMA_VERSION;
use crate::scope::{ScopeGuard, WriteScope};
use crate::signature::SignatureCalculator;
use crate::store::{Clock, FileStore};
use crate::writer::{ProjectionWriter, WriteOutcome};

pub struct IndexCoordinator {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn FileStore>,
    writer: Arc<ProjectionWriter>,
    signer: Arc<SignatureCalculator>,
    queue: Arc<ReindexQueue>,
    clock: Arc<dyn Clock>,
    mode: IndexingMode,
}

impl IndexCoordinator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Arc<dyn FileStore>,
        writer: Arc<ProjectionWriter>,
        signer: Arc<SignatureCalculator>,
        queue: Arc<ReindexQueue>,
        clock: Arc<dyn Clock>,
        mode: IndexingMode,
    ) -> Self {
        Self {
            pool,
            store,
            writer,
            signer,
            queue,
            clock,
            mode,
        }
    }

    pub fn mode(&self) -> IndexingMode {
        self.mode
    }

    /// Entry point for aggregate mutations. Same-transaction deployments
    /// bring the projection up to date before returning; deferred ones
    /// only record an intent for the background processor.
    pub async fn handle_mutation(
        &self,
        file_id: FileId,
        reason: ReindexReason,
        cancel: &CancellationToken,
    ) -> Result<IndexUpdateResult> {
        match self.mode {
            IndexingMode::SameTransaction => self.reindex(file_id, reason, cancel).await,
            IndexingMode::Deferred => {
                self.enqueue(file_id, reason, self.clock.utc_now(), cancel)
                    .await?;
                Ok(IndexUpdateResult::Succeeded)
            }
        }
    }

    /// Records a reindex intent for later background processing.
    pub async fn enqueue(
        &self,
        file_id: FileId,
        reason: ReindexReason,
        requested_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        if cancel.is_cancelled() {
            return Err(IndexError::Canceled);
        }
        self.queue.enqueue(file_id, reason, requested_utc).await
    }

    /// Records a reindex intent inside an ambient write scope so it
    /// commits together with the aggregate change.
    pub async fn enqueue_in_scope(
        &self,
        scope: &mut WriteScope,
        guard: &ScopeGuard,
        file_id: FileId,
        reason: ReindexReason,
        requested_utc: DateTime<Utc>,
    ) -> Result<i64> {
        ReindexQueue::enqueue_on(scope.connection(guard)?, file_id, reason, requested_utc).await
    }

    /// Brings one file's projection up to date.
    pub async fn reindex(
        &self,
        file_id: FileId,
        reason: ReindexReason,
        cancel: &CancellationToken,
    ) -> Result<IndexUpdateResult> {
        if cancel.is_cancelled() {
            return Err(IndexError::Canceled);
        }

        let Some(file) = self.store.get(file_id).await? else {
            debug!(%file_id, reason = reason.as_str(), "reindex target missing from aggregate");
            return Ok(IndexUpdateResult::NotFound);
        };

        let signature = self.signer.compute(&file)?;
        let handle = self.pool.handle().await;
        let mut scope = WriteScope::begin(&handle).await?;
        let guard = scope.guard();

        let row: Option<(Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT stored_content_hash, stored_token_hash, title \
             FROM search_document WHERE file_id = ?",
        )
        .bind(file_id.to_string())
        .fetch_optional(scope.connection(&guard)?)
        .await?;

        // Up to date means both sides agree with the fresh signature: the
        // projection row and the aggregate's recorded index state. A row
        // that is current while the state lags (a lost confirm) still goes
        // through the write path below so the confirm is replayed.
        let row_current = matches!(&row, Some((stored_content, stored_token, stored_title))
            if stored_content.as_deref() == Some(file.content.hash.as_str())
                && stored_token.as_deref() == signature.token_hash.as_deref()
                && stored_title.as_deref() == Some(signature.normalized_title.as_str()));
        let state_current = matches!(&file.search_index_state, Some(state)
            if state.analyzer_version == signature.analyzer_version
                && state.token_hash == signature.token_hash
                && state.indexed_content_hash == file.content.hash);
        if row_current && state_current {
            scope.rollback().await?;
            return Ok(IndexUpdateResult::NoChanges);
        }

        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(IndexError::Canceled);
        }

        // The expectations are the hashes committed at the last confirmed
        // projection, as recorded on the aggregate.
        let state = file.search_index_state.as_ref();
        let expected_content = state.map(|s| s.indexed_content_hash.as_str());
        let expected_token = state.and_then(|s| s.token_hash.as_deref());

        let outcome = self
            .writer
            .upsert(
                &mut scope,
                &guard,
                &file,
                expected_content,
                expected_token,
                &file.content.hash,
                signature.token_hash.as_deref(),
            )
            .await;

        match outcome {
            Ok(WriteOutcome::Applied) => {}
            Ok(WriteOutcome::Skipped) => {
                scope.rollback().await?;
                return Ok(IndexUpdateResult::NoChanges);
            }
            Err(IndexError::AnalyzerOrContentDrift(_)) => {
                debug!(%file_id, "stored hashes drifted, force replacing projection");
                self.writer
                    .force_replace(
                        &mut scope,
                        &guard,
                        &file,
                        &file.content.hash,
                        signature.token_hash.as_deref(),
                    )
                    .await?;
            }
            Err(err) => {
                scope.rollback().await?;
                return Err(err);
            }
        }

        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(IndexError::Canceled);
        }

        let now = self.clock.utc_now();
        self.store
            .confirm_indexed(
                file.id,
                SearchIndexState {
                    last_indexed_utc: now,
                    schema_version: CURRENT_SCHEMA_VERSION,
                    analyzer_version: signature.analyzer_version.clone(),
                    token_hash: signature.token_hash.clone(),
                    indexed_content_hash: file.content.hash.clone(),
                    indexed_title: signature.normalized_title.clone(),
                },
            )
            .await?;

        scope.commit().await?;
        Ok(IndexUpdateResult::Succeeded)
    }
}
