//! Error kinds for the search core.
//!
//! Transient storage contention (`StorageBusy`) and optimistic-guard misses
//! (`StaleProjectionUpdate`, `AnalyzerOrContentDrift`) are recoverable and
//! handled by callers; `SearchIndexCorrupted` is fatal and stops background
//! workers. Expected outcomes of index maintenance surface as
//! [`IndexUpdateResult`](crate::model::IndexUpdateResult), not as errors.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    /// Null/empty mandatory input. Fail immediately, never enqueue.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The analyzer was asked for a profile that is not configured.
    #[error("unknown analyzer profile: {0}")]
    UnknownAnalyzerProfile(String),

    /// A projection write was attempted outside an active write scope.
    #[error("projection write requires an active transaction scope")]
    NoAmbientTransaction,

    /// The scope guard presented does not belong to the active write scope.
    #[error("scope guard does not match the active transaction")]
    WrongTransaction,

    /// Guarded upsert matched zero rows and the stored row differs from the
    /// intended values. The caller refreshes expected hashes and retries.
    #[error("stale projection update for file {0}")]
    StaleProjectionUpdate(Uuid),

    /// Guarded upsert matched zero rows but the stored row already equals
    /// the intended values; only the recorded hashes drifted. The
    /// coordinator retries with a force replace.
    #[error("analyzer or content drift detected for file {0}")]
    AnalyzerOrContentDrift(Uuid),

    /// SQLite reported busy/locked past the retry budget.
    #[error("storage busy after {attempts} attempts")]
    StorageBusy { attempts: u32 },

    /// The storage layer reported a malformed index or a missing FTS object.
    #[error("search index corrupted: {0}")]
    SearchIndexCorrupted(String),

    /// A background iteration exceeded its wall-clock deadline.
    #[error("operation timed out")]
    Timeout,

    /// Cooperative cancellation was observed. Any open transaction has been
    /// rolled back before this propagates.
    #[error("operation canceled")]
    Canceled,

    /// A write-ahead entry cannot be replayed and was moved to the DLQ.
    #[error("journal entry {id} cannot be replayed: {reason}")]
    ReplayPoison { id: i64, reason: String },

    #[error("storage error: {0}")]
    Storage(sqlx::Error),
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(message) = corruption_message(&err) {
            return IndexError::SearchIndexCorrupted(message);
        }
        IndexError::Storage(err)
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED class failures that the busy-retry
/// policy may absorb.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            // Primary codes 5 (SQLITE_BUSY) and 6 (SQLITE_LOCKED), plus
            // their extended variants (low byte carries the primary code).
            let code_busy = db
                .code()
                .and_then(|c| c.as_ref().parse::<u32>().ok())
                .map(|c| matches!(c & 0xff, 5 | 6))
                .unwrap_or(false);
            code_busy
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Extracts a corruption description when the error is fatal for the index.
fn corruption_message(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = err {
        let message = db.message();
        let code_corrupt = db
            .code()
            .map(|c| {
                let c = c.as_ref();
                c == "11" || c == "26"
            })
            .unwrap_or(false);
        if code_corrupt
            || message.contains("malformed")
            || message.contains("fts5: corrupt")
            || message.contains("no such table: search_document_fts")
            || message.contains("no such table: file_trgm")
        {
            return Some(message.to_string());
        }
    }
    None
}

impl IndexError {
    /// Fatal errors stop the background processor instead of feeding backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::SearchIndexCorrupted(_))
    }
}
