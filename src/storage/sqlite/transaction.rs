//! Explicit SQLite write transactions.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;

use crate::storage::{Result, StorageError};

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Business mutations and their outbox record are written through
/// [`WriteTransaction::conn`] and become visible together on [`commit`].
/// Dropping an unfinished transaction discards its connection instead of
/// returning it to the pool with the transaction still open, which SQLite
/// rolls back when the connection closes.
///
/// [`commit`]: WriteTransaction::commit
pub struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTransaction {
    /// Start a write transaction.
    ///
    /// BEGIN IMMEDIATE takes the write lock upfront, so concurrent writers
    /// queue on the busy timeout instead of failing to upgrade a read lock.
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    /// Connection bound to this transaction.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or(StorageError::TransactionFinished)
    }

    pub async fn commit(mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(StorageError::TransactionFinished)?;
        match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
                    drop(conn.detach());
                }
                Err(e.into())
            }
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(StorageError::TransactionFinished)?;
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(())
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the result through.
    pub async fn finish<T, E>(self, result: std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<StorageError>,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Write transaction dropped while open, discarding connection");
            drop(conn.detach());
        }
    }
}
