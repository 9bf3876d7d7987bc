//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden, Clone, Copy)]
pub enum EventRecords {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "event_type"]
    EventType,
    #[iden = "event_outcome"]
    EventOutcome,
    #[iden = "event_payload"]
    EventPayload,
    #[iden = "event_status"]
    EventStatus,
    #[iden = "reply_channel"]
    ReplyChannel,
    #[iden = "published_at"]
    PublishedAt,
    #[iden = "created_by"]
    CreatedBy,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_by"]
    UpdatedBy,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Columns selected when materializing an `EventRecord`.
pub const EVENT_RECORD_COLUMNS: [EventRecords; 12] = [
    EventRecords::EventId,
    EventRecords::SagaId,
    EventRecords::EventType,
    EventRecords::EventOutcome,
    EventRecords::EventPayload,
    EventRecords::EventStatus,
    EventRecords::ReplyChannel,
    EventRecords::PublishedAt,
    EventRecords::CreatedBy,
    EventRecords::CreatedAt,
    EventRecords::UpdatedBy,
    EventRecords::UpdatedAt,
];

/// Students table schema.
#[derive(Iden, Clone, Copy)]
pub enum Students {
    Table,
    #[iden = "student_id"]
    StudentId,
    #[iden = "pen"]
    Pen,
    #[iden = "true_student_id"]
    TrueStudentId,
    #[iden = "data"]
    Data,
    #[iden = "created_by"]
    CreatedBy,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_by"]
    UpdatedBy,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Student history table schema.
#[derive(Iden, Clone, Copy)]
pub enum StudentHistories {
    #[iden = "student_history"]
    Table,
    #[iden = "student_history_id"]
    StudentHistoryId,
    #[iden = "student_id"]
    StudentId,
    #[iden = "history_activity_code"]
    HistoryActivityCode,
    #[iden = "snapshot"]
    Snapshot,
    #[iden = "created_by"]
    CreatedBy,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_by"]
    UpdatedBy,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Scheduler lease table schema.
#[derive(Iden, Clone, Copy)]
pub enum SchedulerLocks {
    #[iden = "scheduler_lock"]
    Table,
    #[iden = "name"]
    Name,
    #[iden = "lock_until"]
    LockUntil,
    #[iden = "locked_at"]
    LockedAt,
    #[iden = "locked_by"]
    LockedBy,
}

/// DDL applied at startup, one statement per entry.
///
/// Timestamps are RFC 3339 UTC strings with fixed nanosecond precision so that
/// lexical comparison in SQL matches chronological order.
pub const MIGRATIONS: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS event_records (
    event_id TEXT PRIMARY KEY NOT NULL,
    saga_id TEXT,
    event_type TEXT NOT NULL,
    event_outcome TEXT,
    event_payload TEXT NOT NULL,
    event_status TEXT NOT NULL,
    reply_channel TEXT,
    published_at TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_event_records_status ON event_records(event_status, created_at)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_event_records_saga_type ON event_records(saga_id, event_type) WHERE saga_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_event_records_created_at ON event_records(created_at)",
    r#"
CREATE TABLE IF NOT EXISTS students (
    student_id TEXT PRIMARY KEY NOT NULL,
    pen TEXT NOT NULL UNIQUE,
    true_student_id TEXT,
    data TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    r#"
CREATE TABLE IF NOT EXISTS student_history (
    student_history_id TEXT PRIMARY KEY NOT NULL,
    student_id TEXT NOT NULL,
    history_activity_code TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_student_history_student ON student_history(student_id)",
    r#"
CREATE TABLE IF NOT EXISTS scheduler_lock (
    name TEXT PRIMARY KEY NOT NULL,
    lock_until TEXT NOT NULL,
    locked_at TEXT NOT NULL,
    locked_by TEXT NOT NULL
)"#,
];
