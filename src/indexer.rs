//! The indexing facade for file mutations.
//!
//! `index` projects a document inside a single write scope: compute the
//! signature, upsert with the live row's stored hashes as expectations,
//! force-replace on drift, refresh the suggestion store, confirm on the
//! aggregate and commit. `delete` removes the projection row and retracts
//! the document's suggestion weights when the aggregate can still supply
//! the document.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::ConnectionPool;
use crate::error::{IndexError, Result};
use crate::model::{FileDocument, FileId, IndexUpdateResult, SearchIndexState};
use crate::query::suggest::SuggestionService;
use crate::schema::CURRENT_SCHEMA_VERSION;
use crate::scope::WriteScope;
use crate::signature::SignatureCalculator;
use crate::store::{Clock, FileStore};
use crate::writer::{ProjectionWriter, WriteOutcome};

pub struct SearchIndexer {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn FileStore>,
    writer: Arc<ProjectionWriter>,
    signer: Arc<SignatureCalculator>,
    suggestions: Arc<SuggestionService>,
    clock: Arc<dyn Clock>,
    max_content_bytes: Option<u64>,
}

impl SearchIndexer {
    pub fn new(
        pool: Arc<ConnectionPool>,
        store: Arc<dyn FileStore>,
        writer: Arc<ProjectionWriter>,
        signer: Arc<SignatureCalculator>,
        suggestions: Arc<SuggestionService>,
        clock: Arc<dyn Clock>,
        max_content_bytes: Option<u64>,
    ) -> Self {
        Self {
            pool,
            store,
            writer,
            signer,
            suggestions,
            clock,
            max_content_bytes,
        }
    }

    /// Projects a document into the search index.
    pub async fn index(
        &self,
        file: &FileDocument,
        cancel: &CancellationToken,
    ) -> Result<IndexUpdateResult> {
        if file.mime.trim().is_empty() {
            return Err(IndexError::InvalidArgument("file mime must not be empty".into()));
        }
        if file.name.trim().is_empty() {
            return Err(IndexError::InvalidArgument("file name must not be empty".into()));
        }
        if cancel.is_cancelled() {
            return Err(IndexError::Canceled);
        }

        let file = self.capped(file);
        let signature = self.signer.compute(&file)?;
        let lang = self
            .signer
            .analyzer()
            .profile_language(None)?
            .to_string();

        let handle = self.pool.handle().await;
        let mut scope = WriteScope::begin(&handle).await?;
        let guard = scope.guard();

        // Expected hashes are whatever the aggregate last confirmed; a
        // projection that ran ahead of a lost confirm surfaces as drift
        // and is repaired with a force replace below.
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
                debug!(file_id = %file.id, "drift during index, force replacing");
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

        self.suggestions
            .harvest(scope.connection(&guard)?, &file, &lang)
            .await?;

        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(IndexError::Canceled);
        }

        self.store
            .confirm_indexed(
                file.id,
                SearchIndexState {
                    last_indexed_utc: self.clock.utc_now(),
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

    /// Removes a document's projection. Suggestion weights are retracted
    /// only while the aggregate can still produce the document.
    pub async fn delete(
        &self,
        file_id: FileId,
        cancel: &CancellationToken,
    ) -> Result<IndexUpdateResult> {
        if cancel.is_cancelled() {
            return Err(IndexError::Canceled);
        }

        let document = self.store.get(file_id).await?;
        let lang = self
            .signer
            .analyzer()
            .profile_language(None)?
            .to_string();

        let handle = self.pool.handle().await;
        let mut scope = WriteScope::begin(&handle).await?;
        let guard = scope.guard();

        let removed = self.writer.delete(&mut scope, &guard, file_id).await?;
        if let Some(document) = &document {
            self.suggestions
                .retract(scope.connection(&guard)?, document, &lang)
                .await?;
        }

        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(IndexError::Canceled);
        }
        scope.commit().await?;

        if removed > 0 {
            Ok(IndexUpdateResult::Succeeded)
        } else {
            Ok(IndexUpdateResult::NoChanges)
        }
    }

    /// Applies the content-size cap: oversized files keep their identity
    /// fields but lose extractor metadata text.
    fn capped(&self, file: &FileDocument) -> FileDocument {
        let mut file = file.clone();
        if let Some(cap) = self.max_content_bytes {
            if file.size_bytes as u64 > cap {
                debug!(file_id = %file.id, size = file.size_bytes, cap, "content above size cap, dropping metadata text");
                file.metadata_text = None;
            }
        }
        file
    }
}
