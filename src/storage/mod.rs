//! Storage layer.
//!
//! The `event_records` table is the single arbiter of delivery state. Business
//! rows (students, history) live in the same database so that a mutation and
//! its outbox record commit in one SQLite transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::model::{EventRecord, EventStatus, EventType};

pub mod schema;
pub mod sqlite;

pub use sqlite::{SqliteEventRecordStore, SqliteStudentStore, WriteTransaction};

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Duplicate event id: {0}")]
    DuplicateEventId(Uuid),

    #[error("Transaction already finished")]
    TransactionFinished,
}

impl StorageError {
    /// Whether the error came from a unique/primary key constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StorageError::DuplicateEventId(_) => true,
            StorageError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Outbox record store.
///
/// `insert` is not part of the trait: records are only ever written inside a
/// business transaction, through [`SqliteEventRecordStore::insert`] on the
/// transaction's connection.
#[async_trait]
pub trait EventRecordStore: Send + Sync {
    /// Records not yet handed to the transport, oldest first.
    async fn find_pending(&self, limit: usize) -> Result<Vec<EventRecord>>;

    async fn find_by_id(&self, event_id: Uuid) -> Result<Option<EventRecord>>;

    /// Idempotency lookup for an inbound command.
    async fn find_by_saga_and_type(
        &self,
        saga_id: Uuid,
        event_type: EventType,
    ) -> Result<Option<EventRecord>>;

    /// Records sent but not acknowledged whose `updated_at` predates `cutoff`.
    async fn find_stale_unacked(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;

    /// Advance status. Returns `false` when the record is missing.
    ///
    /// Idempotent: setting the current status again succeeds. A transition
    /// that would regress the lifecycle leaves the row untouched.
    async fn update_status(&self, event_id: Uuid, status: EventStatus) -> Result<bool>;

    /// Stamp a deferred-ack record as handed to the transport at `at`.
    async fn mark_sent(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Delete every record created before `cutoff`, regardless of status.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Canonical stored form of a timestamp.
///
/// Fixed precision keeps lexical order equal to chronological order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("timestamp '{}': {}", value, e)))
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StorageError::InvalidData(format!("uuid '{}': {}", value, e)))
}

pub(crate) fn parse_stored<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StorageError::InvalidData(e.to_string()))
}

/// Open the SQLite pool and apply the schema.
pub async fn init_storage(config: &StorageConfig) -> Result<SqlitePool> {
    info!(path = %config.path, "Storage: sqlite");

    let in_memory = config.path == ":memory:";
    let options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::InvalidData(format!("{}: {}", config.path, e)))?;
            }
        }
        SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    }
    .busy_timeout(config.busy_timeout());

    // Every connection to ":memory:" is its own database, so keep exactly one alive.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?
    };

    migrate(&pool).await?;
    Ok(pool)
}

/// Apply the schema. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in schema::MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
