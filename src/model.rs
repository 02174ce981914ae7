//! Core data models flowing through the indexing and retrieval pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Canonical timestamp encoding: RFC 3339 UTC with a `Z` suffix and whole
/// seconds, e.g. `2024-03-01T12:00:00Z`. Sorts lexicographically and is
/// parseable by SQLite's date functions.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 128-bit opaque file identifier. Persisted as canonical lowercase
/// hyphenated text in every table.
pub type FileId = Uuid;

/// Authoritative file content as seen by the aggregate store.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`, computed by the aggregate.
    pub hash: String,
}

impl FileContent {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = hex::encode(hasher.finalize());
        Self { bytes, hash }
    }
}

/// A file aggregate as consumed from the authoritative store.
///
/// The search core never mutates a file except through
/// [`confirm_indexed`](FileDocument::confirm_indexed).
#[derive(Debug, Clone)]
pub struct FileDocument {
    pub id: FileId,
    /// Filename, including extension.
    pub name: String,
    pub title: String,
    pub author: Option<String>,
    pub mime: String,
    pub size_bytes: i64,
    pub created_utc: DateTime<Utc>,
    pub modified_utc: DateTime<Utc>,
    pub content: FileContent,
    /// Plain-text rendition of file metadata, produced by external extractors.
    pub metadata_text: Option<String>,
    /// Raw metadata JSON, stored verbatim on the projection row.
    pub metadata_json: Option<String>,
    pub search_index_state: Option<SearchIndexState>,
}

impl FileDocument {
    /// Records a successful projection commit on the aggregate side.
    pub fn confirm_indexed(
        &mut self,
        schema_version: i32,
        now: DateTime<Utc>,
        analyzer_version: String,
        token_hash: Option<String>,
        normalized_title: String,
    ) {
        self.search_index_state = Some(SearchIndexState {
            last_indexed_utc: now,
            schema_version,
            analyzer_version,
            token_hash,
            indexed_content_hash: self.content.hash.clone(),
            indexed_title: normalized_title,
        });
    }
}

/// Search index bookkeeping attached to each file in the aggregate.
/// Updated only after a successful projection commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchIndexState {
    pub last_indexed_utc: DateTime<Utc>,
    pub schema_version: i32,
    pub analyzer_version: String,
    pub token_hash: Option<String>,
    pub indexed_content_hash: String,
    pub indexed_title: String,
}

/// A projection row read back from `search_document`.
#[derive(Debug, Clone)]
pub struct ProjectionRow {
    pub file_id: FileId,
    pub title: Option<String>,
    pub author: Option<String>,
    pub mime: String,
    pub metadata_text: Option<String>,
    pub metadata_json: Option<String>,
    pub size_bytes: i64,
    pub created_utc: DateTime<Utc>,
    pub modified_utc: DateTime<Utc>,
    pub content_hash: String,
    pub stored_content_hash: Option<String>,
    pub stored_token_hash: Option<String>,
}

/// Which engine produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HitSource {
    #[serde(rename = "LEXICAL")]
    Lexical,
    #[serde(rename = "TRIGRAM")]
    Trigram,
}

/// A ranked search result.
///
/// Scores live in `[0.0, 1.0]`; snippets carry `[bracketed]` match
/// highlights when the engine could locate one.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file_id: FileId,
    pub title: String,
    pub mime: String,
    pub score: f64,
    pub snippet: String,
    pub modified_utc: DateTime<Utc>,
    pub exact_title_match: bool,
    pub source: HitSource,
}

impl SearchHit {
    /// Whether the snippet contains a bracketed match highlight.
    pub fn has_highlight(&self) -> bool {
        self.snippet.contains('[') && self.snippet.contains(']')
    }
}

/// Outcome of an index-maintenance operation. Expected outcomes are data,
/// not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexUpdateResult {
    Succeeded,
    NoChanges,
    NotFound,
    Failed(String),
}

impl IndexUpdateResult {
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            IndexUpdateResult::Succeeded | IndexUpdateResult::NoChanges | IndexUpdateResult::NotFound
        )
    }
}

/// Why a file was enqueued for reindexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexReason {
    ContentChanged,
    AnalyzerChanged,
    IntegrityRepair,
    ExternalRequest,
}

impl ReindexReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexReason::ContentChanged => "content-changed",
            ReindexReason::AnalyzerChanged => "analyzer-changed",
            ReindexReason::IntegrityRepair => "integrity-repair",
            ReindexReason::ExternalRequest => "external-request",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "content-changed" => Some(ReindexReason::ContentChanged),
            "analyzer-changed" => Some(ReindexReason::AnalyzerChanged),
            "integrity-repair" => Some(ReindexReason::IntegrityRepair),
            "external-request" => Some(ReindexReason::ExternalRequest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_hex_sha256() {
        let content = FileContent::from_bytes(b"hello world".to_vec());
        assert_eq!(
            content.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn confirm_indexed_mirrors_content_hash() {
        let mut doc = FileDocument {
            id: Uuid::new_v4(),
            name: "report.txt".into(),
            title: "Report".into(),
            author: None,
            mime: "text/plain".into(),
            size_bytes: 11,
            created_utc: Utc::now(),
            modified_utc: Utc::now(),
            content: FileContent::from_bytes(b"hello world".to_vec()),
            metadata_text: None,
            metadata_json: None,
            search_index_state: None,
        };
        doc.confirm_indexed(1, Utc::now(), "v1".into(), Some("t1".into()), "report".into());
        let state = doc.search_index_state.as_ref().unwrap();
        assert_eq!(state.indexed_content_hash, doc.content.hash);
        assert_eq!(state.token_hash.as_deref(), Some("t1"));
    }

    #[test]
    fn reindex_reason_round_trips() {
        for reason in [
            ReindexReason::ContentChanged,
            ReindexReason::AnalyzerChanged,
            ReindexReason::IntegrityRepair,
            ReindexReason::ExternalRequest,
        ] {
            assert_eq!(ReindexReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(ReindexReason::parse("bogus"), None);
    }
}
