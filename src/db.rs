//! Pooled SQLite access.
//!
//! Every connection minted by the pool is primed with the same pragma set
//! (WAL journal, foreign keys, synchronous=NORMAL, busy timeout,
//! temp_store=MEMORY) through the connect options, so the pragmas run on
//! every open, not just the first. `reset()` swaps the inner pool and bumps
//! a generation counter; leases handed out against the old generation drain
//! and are discarded with it.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Sqlite;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::Result;

/// A scoped connection lease. Released back to the pool on drop, on every
/// exit path.
pub type Lease = PoolConnection<Sqlite>;

pub struct ConnectionPool {
    options: SqliteConnectOptions,
    max_size: u32,
    inner: RwLock<SqlitePool>,
    generation: AtomicU64,
}

impl ConnectionPool {
    pub async fn open(config: &Config) -> Result<Self> {
        let options = connect_options(&config.db.path, config.pool.busy_timeout_ms)?;
        let pool = build_pool(options.clone(), config.pool.max_pool_size).await?;
        Ok(Self {
            options,
            max_size: config.pool.max_pool_size,
            inner: RwLock::new(pool),
            generation: AtomicU64::new(0),
        })
    }

    /// Rents a pooled handle, constructing a new one when the pool has
    /// capacity to grow.
    pub async fn rent(&self) -> Result<Lease> {
        let pool = self.handle().await;
        Ok(pool.acquire().await?)
    }

    /// A cloned handle to the current-generation inner pool, for sqlx APIs
    /// that take `&Pool`.
    pub async fn handle(&self) -> SqlitePool {
        self.inner.read().await.clone()
    }

    /// Discards all pooled handles. In-flight leases finish against the old
    /// generation and are dropped rather than returned.
    pub async fn reset(&self) -> Result<()> {
        let fresh = build_pool(self.options.clone(), self.max_size).await?;
        let old = {
            let mut guard = self.inner.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        old.close().await;
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.inner.read().await.close().await;
    }
}

fn connect_options(path: &Path, busy_timeout_ms: u64) -> Result<SqliteConnectOptions> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::IndexError::InvalidArgument(format!(
                "cannot create database directory {}: {e}",
                parent.display()
            )))?;
    }

    Ok(SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms))
        .pragma("temp_store", "MEMORY"))
}

async fn build_pool(options: SqliteConnectOptions, max_size: u32) -> Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(max_size)
        .connect_with(options)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (tempfile::TempDir, Config) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("index.sqlite"));
        (tmp, config)
    }

    #[tokio::test]
    async fn rent_returns_a_usable_lease() {
        let (_tmp, config) = temp_config();
        let pool = ConnectionPool::open(&config).await.unwrap();
        let mut lease = pool.rent().await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&mut *lease)
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn pragmas_apply_on_every_open() {
        let (_tmp, config) = temp_config();
        let pool = ConnectionPool::open(&config).await.unwrap();
        let mut lease = pool.rent().await.unwrap();
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&mut *lease)
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut *lease)
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[tokio::test]
    async fn reset_bumps_generation() {
        let (_tmp, config) = temp_config();
        let pool = ConnectionPool::open(&config).await.unwrap();
        assert_eq!(pool.generation(), 0);
        pool.reset().await.unwrap();
        assert_eq!(pool.generation(), 1);
        // The fresh generation still serves leases.
        let mut lease = pool.rent().await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&mut *lease)
            .await
            .unwrap();
        assert_eq!(one, 1);
    }
}
