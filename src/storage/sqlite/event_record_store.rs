//! SQLite EventRecordStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::model::{EventRecord, EventStatus, EventType};
use crate::storage::schema::{EventRecords, EVENT_RECORD_COLUMNS};
use crate::storage::{
    format_timestamp, parse_stored, parse_timestamp, parse_uuid, EventRecordStore, Result,
    StorageError,
};

const SYSTEM_PRINCIPAL: &str = "student-outbox";

/// SQLite implementation of EventRecordStore.
#[derive(Clone)]
pub struct SqliteEventRecordStore {
    pool: SqlitePool,
    principal: String,
}

impl SqliteEventRecordStore {
    /// Create a new SQLite event record store.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            principal: SYSTEM_PRINCIPAL.to_string(),
        }
    }

    /// Principal written to `updated_by` on status changes.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a record within the caller's open transaction.
    pub async fn insert(conn: &mut SqliteConnection, record: &EventRecord) -> Result<()> {
        let query = Query::insert()
            .into_table(EventRecords::Table)
            .columns(EVENT_RECORD_COLUMNS)
            .values_panic([
                record.event_id.to_string().into(),
                record.saga_id.map(|id| id.to_string()).into(),
                record.event_type.as_str().into(),
                record.event_outcome.map(|o| o.as_str().to_string()).into(),
                record.event_payload.clone().into(),
                record.event_status.as_str().into(),
                record.reply_channel.clone().into(),
                record.published_at.map(format_timestamp).into(),
                record.created_by.clone().into(),
                format_timestamp(record.created_at).into(),
                record.updated_by.clone().into(),
                format_timestamp(record.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && db.message().contains("event_records.event_id") =>
            {
                Err(StorageError::DuplicateEventId(record.event_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotency lookup within the caller's open transaction.
    pub async fn find_by_saga_and_type_in(
        conn: &mut SqliteConnection,
        saga_id: Uuid,
        event_type: EventType,
    ) -> Result<Option<EventRecord>> {
        let query = Query::select()
            .columns(EVENT_RECORD_COLUMNS)
            .from(EventRecords::Table)
            .and_where(Expr::col(EventRecords::SagaId).eq(saga_id.to_string()))
            .and_where(Expr::col(EventRecords::EventType).eq(event_type.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Refresh `updated_*` on a replayed record so the reconciler's grace
    /// period restarts and the record is seen as recently requested.
    pub async fn touch_in(
        conn: &mut SqliteConnection,
        event_id: Uuid,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::update()
            .table(EventRecords::Table)
            .values([
                (EventRecords::UpdatedBy, principal.into()),
                (EventRecords::UpdatedAt, format_timestamp(now).into()),
            ])
            .and_where(Expr::col(EventRecords::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    async fn exists(&self, event_id: Uuid) -> Result<bool> {
        let query = Query::select()
            .column(EventRecords::EventId)
            .from(EventRecords::Table)
            .and_where(Expr::col(EventRecords::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }
}

#[async_trait]
impl EventRecordStore for SqliteEventRecordStore {
    async fn find_pending(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let query = Query::select()
            .columns(EVENT_RECORD_COLUMNS)
            .from(EventRecords::Table)
            .and_where(Expr::col(EventRecords::EventStatus).eq(EventStatus::DbCommitted.as_str()))
            .and_where(Expr::col(EventRecords::PublishedAt).is_null())
            .order_by(EventRecords::CreatedAt, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_id(&self, event_id: Uuid) -> Result<Option<EventRecord>> {
        let query = Query::select()
            .columns(EVENT_RECORD_COLUMNS)
            .from(EventRecords::Table)
            .and_where(Expr::col(EventRecords::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_saga_and_type(
        &self,
        saga_id: Uuid,
        event_type: EventType,
    ) -> Result<Option<EventRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_by_saga_and_type_in(&mut conn, saga_id, event_type).await
    }

    async fn find_stale_unacked(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let query = Query::select()
            .columns(EVENT_RECORD_COLUMNS)
            .from(EventRecords::Table)
            .and_where(Expr::col(EventRecords::EventStatus).eq(EventStatus::DbCommitted.as_str()))
            .and_where(Expr::col(EventRecords::PublishedAt).is_not_null())
            .and_where(Expr::col(EventRecords::UpdatedAt).lt(format_timestamp(cutoff)))
            .order_by(EventRecords::UpdatedAt, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_status(&self, event_id: Uuid, status: EventStatus) -> Result<bool> {
        let allowed_from: Vec<&str> = [EventStatus::DbCommitted, EventStatus::MessagePublished]
            .into_iter()
            .filter(|from| from.can_advance_to(status))
            .map(|from| from.as_str())
            .collect();

        let query = Query::update()
            .table(EventRecords::Table)
            .values([
                (EventRecords::EventStatus, status.as_str().into()),
                (EventRecords::UpdatedBy, self.principal.clone().into()),
                (EventRecords::UpdatedAt, format_timestamp(Utc::now()).into()),
            ])
            .and_where(Expr::col(EventRecords::EventId).eq(event_id.to_string()))
            .and_where(Expr::col(EventRecords::EventStatus).is_in(allowed_from))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.exists(event_id).await
    }

    async fn mark_sent(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let stamp = format_timestamp(at);
        let query = Query::update()
            .table(EventRecords::Table)
            .values([
                (EventRecords::PublishedAt, stamp.clone().into()),
                (EventRecords::UpdatedBy, self.principal.clone().into()),
                (EventRecords::UpdatedAt, stamp.into()),
            ])
            .and_where(Expr::col(EventRecords::EventId).eq(event_id.to_string()))
            .and_where(Expr::col(EventRecords::EventStatus).eq(EventStatus::DbCommitted.as_str()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(EventRecords::Table)
            .and_where(Expr::col(EventRecords::CreatedAt).lt(format_timestamp(cutoff)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<EventRecord> {
    let event_id: String = row.try_get("event_id")?;
    let saga_id: Option<String> = row.try_get("saga_id")?;
    let event_type: String = row.try_get("event_type")?;
    let event_outcome: Option<String> = row.try_get("event_outcome")?;
    let event_status: String = row.try_get("event_status")?;
    let published_at: Option<String> = row.try_get("published_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(EventRecord {
        event_id: parse_uuid(&event_id)?,
        saga_id: saga_id.as_deref().map(parse_uuid).transpose()?,
        event_type: parse_stored(&event_type)?,
        event_outcome: event_outcome.as_deref().map(parse_stored).transpose()?,
        event_payload: row.try_get("event_payload")?,
        event_status: parse_stored(&event_status)?,
        reply_channel: row.try_get("reply_channel")?,
        published_at: published_at.as_deref().map(parse_timestamp).transpose()?,
        created_by: row.try_get("created_by")?,
        created_at: parse_timestamp(&created_at)?,
        updated_by: row.try_get("updated_by")?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
