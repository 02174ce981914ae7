//! Storage capability snapshot.
//!
//! Whether the full-text schema is present is discovered once at startup
//! and whenever the schema migrates, then exposed as an immutable snapshot.
//! All projection writers consult the snapshot before touching FTS tables;
//! when the schema is absent they degrade to a no-op instead of failing
//! every write.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::schema::CURRENT_SCHEMA_VERSION;

const REQUIRED_TABLES: &[&str] = &[
    "search_document",
    "search_document_fts",
    "file_search_map",
    "file_trgm",
    "file_trgm_map",
    "fts_write_ahead",
    "fts_write_ahead_dlq",
];

/// Immutable snapshot of the full-text schema state.
#[derive(Debug, Clone)]
pub struct FtsCapability {
    available: bool,
    reason: Option<String>,
    schema_version: i32,
}

impl FtsCapability {
    /// Probes `sqlite_master` for every object the projection writer needs.
    pub async fn probe(pool: &SqlitePool) -> Result<Self> {
        let mut missing = Vec::new();
        for table in REQUIRED_TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(pool)
            .await?;
            if !exists {
                missing.push(*table);
            }
        }

        if missing.is_empty() {
            Ok(Self {
                available: true,
                reason: None,
                schema_version: CURRENT_SCHEMA_VERSION,
            })
        } else {
            Ok(Self {
                available: false,
                reason: Some(format!("missing storage objects: {}", missing.join(", "))),
                schema_version: CURRENT_SCHEMA_VERSION,
            })
        }
    }

    /// A snapshot that reports the schema as unavailable without probing.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn schema_version(&self) -> i32 {
        self.schema_version
    }
}
