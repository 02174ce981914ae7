//! Search history and saved favorites.
//!
//! History deduplicates by match expression and counts executions;
//! favorites are named queries with a manual ordering position.

use std::sync::Arc;

use uuid::Uuid;

use crate::db::ConnectionPool;
use crate::error::{IndexError, Result};
use crate::model::format_utc;
use crate::store::Clock;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: String,
    pub query_text: Option<String>,
    pub match_expr: String,
    pub created_utc: String,
    pub executions: i64,
    pub last_total_hits: Option<i64>,
}

pub struct SearchHistoryService {
    pool: Arc<ConnectionPool>,
    clock: Arc<dyn Clock>,
}

impl SearchHistoryService {
    pub fn new(pool: Arc<ConnectionPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Records an executed query. Re-running the same match expression
    /// bumps its execution counter instead of inserting a new row.
    pub async fn record(
        &self,
        query_text: Option<&str>,
        match_expr: &str,
        total_hits: Option<i64>,
    ) -> Result<()> {
        if match_expr.trim().is_empty() {
            return Err(IndexError::InvalidArgument(
                "match expression must not be empty".into(),
            ));
        }
        let handle = self.pool.handle().await;
        sqlx::query(
            "INSERT INTO search_history (id, query_text, match_expr, created_utc, executions, last_total_hits) \
             VALUES (?, ?, ?, ?, 1, ?) \
             ON CONFLICT(match_expr) DO UPDATE SET \
               executions = executions + 1, \
               query_text = excluded.query_text, \
               last_total_hits = excluded.last_total_hits",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(query_text)
        .bind(match_expr)
        .bind(format_utc(self.clock.utc_now()))
        .bind(total_hits)
        .execute(&handle)
        .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        let handle = self.pool.handle().await;
        Ok(sqlx::query_as::<_, HistoryEntry>(
            "SELECT id, query_text, match_expr, created_utc, executions, last_total_hits \
             FROM search_history \
             ORDER BY created_utc DESC, executions DESC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&handle)
        .await?)
    }

    pub async fn clear(&self) -> Result<u64> {
        let handle = self.pool.handle().await;
        let result = sqlx::query("DELETE FROM search_history").execute(&handle).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FavoriteEntry {
    pub id: String,
    pub name: String,
    pub query_text: Option<String>,
    pub match_expr: String,
    pub position: i64,
    pub created_utc: String,
    pub is_fuzzy: bool,
}

pub struct SearchFavoritesService {
    pool: Arc<ConnectionPool>,
    clock: Arc<dyn Clock>,
}

impl SearchFavoritesService {
    pub fn new(pool: Arc<ConnectionPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Saves a named query at the end of the list and returns its id.
    pub async fn save(
        &self,
        name: &str,
        query_text: Option<&str>,
        match_expr: &str,
        is_fuzzy: bool,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(IndexError::InvalidArgument("favorite name must not be empty".into()));
        }
        if match_expr.trim().is_empty() {
            return Err(IndexError::InvalidArgument(
                "match expression must not be empty".into(),
            ));
        }

        let handle = self.pool.handle().await;
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO search_favorites (id, name, query_text, match_expr, position, created_utc, is_fuzzy) \
             VALUES (?, ?, ?, ?, \
                     (SELECT COALESCE(MAX(position) + 1, 0) FROM search_favorites), ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(query_text)
        .bind(match_expr)
        .bind(format_utc(self.clock.utc_now()))
        .bind(is_fuzzy)
        .execute(&handle)
        .await?;
        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<FavoriteEntry>> {
        let handle = self.pool.handle().await;
        Ok(sqlx::query_as::<_, FavoriteEntry>(
            "SELECT id, name, query_text, match_expr, position, created_utc, is_fuzzy \
             FROM search_favorites \
             ORDER BY position ASC, created_utc ASC",
        )
        .fetch_all(&handle)
        .await?)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(IndexError::InvalidArgument("favorite name must not be empty".into()));
        }
        let handle = self.pool.handle().await;
        sqlx::query("UPDATE search_favorites SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&handle)
            .await?;
        Ok(())
    }

    pub async fn reposition(&self, id: &str, position: i64) -> Result<()> {
        let handle = self.pool.handle().await;
        sqlx::query("UPDATE search_favorites SET position = ? WHERE id = ?")
            .bind(position)
            .bind(id)
            .execute(&handle)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let handle = self.pool.handle().await;
        sqlx::query("DELETE FROM search_favorites WHERE id = ?")
            .bind(id)
            .execute(&handle)
            .await?;
        Ok(())
    }
}
