//! Test fixtures shared by the unit tests.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::model::{Audit, EventOutcome, EventRecord, EventType, Student, StudentDraft};
use crate::storage::init_storage;

/// A migrated pool on a fresh database file. Keep the directory alive for
/// the duration of the test.
pub async fn temp_pool() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = StorageConfig {
        path: dir.path().join("outbox.db").to_string_lossy().into_owned(),
        ..StorageConfig::default()
    };
    let pool = init_storage(&config).await.expect("storage");
    (dir, pool)
}

/// A pending record with fresh ids, stamped `at`.
pub fn make_record(event_type: EventType, at: DateTime<Utc>) -> EventRecord {
    let outcome = match event_type {
        EventType::CreateStudent => EventOutcome::StudentCreated,
        EventType::UpdateStudent => EventOutcome::StudentUpdated,
        EventType::DeleteStudent => EventOutcome::StudentDeleted,
        EventType::CreateStudentHistory => EventOutcome::StudentHistoryCreated,
        _ => EventOutcome::StudentFound,
    };
    EventRecord::new(
        Uuid::new_v4(),
        Some(Uuid::new_v4()),
        event_type,
        outcome,
        format!("{{\"studentID\":\"{}\"}}", Uuid::new_v4()),
        "test",
        at,
    )
}

pub fn make_draft(pen: &str, last_name: &str) -> StudentDraft {
    StudentDraft {
        pen: pen.to_string(),
        legal_first_name: Some("Bruce".to_string()),
        legal_last_name: last_name.to_string(),
        ..StudentDraft::default()
    }
}

pub fn make_student(pen: &str, last_name: &str) -> Student {
    Student {
        student_id: Uuid::new_v4(),
        fields: make_draft(pen, last_name),
        audit: Audit::created("test", Utc::now()),
    }
}
