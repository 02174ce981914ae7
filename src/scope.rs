//! Explicit write scopes.
//!
//! A [`WriteScope`] owns a SQLite transaction plus a guard token that
//! uniquely identifies the scope. Projection writes demand both the scope
//! and a matching [`ScopeGuard`]: a finished scope raises
//! `NoAmbientTransaction`, a guard minted by a different scope raises
//! `WrongTransaction`. Dropping an uncommitted scope rolls the transaction
//! back, which is also the cancellation path.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{IndexError, Result};

/// Token identifying a write scope. Cheap to copy and safe to thread
/// through call chains; useless without the scope it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeGuard {
    token: Uuid,
}

pub struct WriteScope {
    tx: Option<Transaction<'static, Sqlite>>,
    token: Uuid,
}

impl WriteScope {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx: Some(tx),
            token: Uuid::new_v4(),
        })
    }

    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard { token: self.token }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// The scope's connection, after verifying the guard belongs here.
    pub fn connection(&mut self, guard: &ScopeGuard) -> Result<&mut SqliteConnection> {
        if guard.token != self.token {
            return Err(IndexError::WrongTransaction);
        }
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(IndexError::NoAmbientTransaction),
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => {
                tx.commit().await?;
                Ok(())
            }
            None => Err(IndexError::NoAmbientTransaction),
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            None => Err(IndexError::NoAmbientTransaction),
        }
    }
}
