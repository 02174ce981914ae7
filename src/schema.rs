//! Database schema migrations.
//!
//! Creates the projection tables, the FTS5 companion tables with their
//! rowid maps, the write-ahead journal and its dead-letter queue, the
//! reindex queue, and the suggestion/history/favorites stores. Idempotent;
//! FTS5 virtual tables are probed through `sqlite_master` first because
//! `CREATE VIRTUAL TABLE` has no `IF NOT EXISTS` everywhere we support.

use sqlx::SqlitePool;

use crate::error::Result;

/// Bumped whenever DDL changes. Recorded on each file's search index state
/// after a successful projection commit.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_document (
            file_id TEXT PRIMARY KEY,
            title TEXT,
            author TEXT,
            mime TEXT NOT NULL,
            metadata_text TEXT,
            metadata_json TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            created_utc TEXT NOT NULL,
            modified_utc TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            stored_content_hash TEXT,
            stored_token_hash TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    create_fts_table(
        pool,
        "search_document_fts",
        "CREATE VIRTUAL TABLE search_document_fts USING fts5(title, mime, author, metadata_text, metadata_json)",
    )
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_search_map (
            file_id TEXT PRIMARY KEY,
            fts_rowid INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    create_fts_table(
        pool,
        "file_trgm",
        "CREATE VIRTUAL TABLE file_trgm USING fts5(trgm)",
    )
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_trgm_map (
            file_id TEXT PRIMARY KEY,
            fts_rowid INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fts_write_ahead (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id TEXT NOT NULL,
            op TEXT NOT NULL,
            content_hash TEXT,
            title_hash TEXT,
            enqueued_utc TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fts_write_ahead_dlq (
            original_id INTEGER PRIMARY KEY,
            file_id TEXT NOT NULL,
            op TEXT NOT NULL,
            content_hash TEXT,
            title_hash TEXT,
            enqueued_utc TEXT NOT NULL,
            dead_lettered_utc TEXT NOT NULL,
            error TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reindex_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            enqueued_utc TEXT NOT NULL,
            processed_utc TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestions (
            term TEXT NOT NULL,
            weight REAL NOT NULL,
            lang TEXT NOT NULL,
            source_field TEXT NOT NULL,
            UNIQUE(term, lang, source_field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id TEXT PRIMARY KEY,
            query_text TEXT,
            match_expr TEXT NOT NULL,
            created_utc TEXT NOT NULL,
            executions INTEGER NOT NULL DEFAULT 1,
            last_total_hits INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_favorites (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            query_text TEXT,
            match_expr TEXT NOT NULL,
            position INTEGER NOT NULL,
            created_utc TEXT NOT NULL,
            is_fuzzy INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reindex_queue_pending \
         ON reindex_queue(processed_utc, enqueued_utc, id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_document_modified \
         ON search_document(modified_utc DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_suggestions_term ON suggestions(term)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_search_history_match ON search_history(match_expr)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_fts_table(pool: &SqlitePool, name: &str, ddl: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;

    if !exists {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::ConnectionPool;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("index.sqlite"));
        let pool = ConnectionPool::open(&config).await.unwrap();
        let handle = pool.handle().await;

        migrate(&handle).await.unwrap();
        migrate(&handle).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('search_document', 'file_search_map', 'file_trgm_map', 'fts_write_ahead', \
              'fts_write_ahead_dlq', 'reindex_queue', 'suggestions', 'search_history', \
              'search_favorites')",
        )
        .fetch_one(&handle)
        .await
        .unwrap();
        assert_eq!(tables, 9);
    }
}
