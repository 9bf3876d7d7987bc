//! Student command handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CodeTableValidator, CodeTables, CommandContext, CommandOutcome, HandlerError, Result};
use crate::model::{
    Audit, EventOutcome, EventRecord, EventType, Student, StudentDraft, StudentHistory,
    StudentHistoryRequest, StudentKey, StudentUpdate, HISTORY_ACTIVITY_CREATE,
    HISTORY_ACTIVITY_EDIT,
};
use crate::storage::{SqliteEventRecordStore, SqliteStudentStore, StorageError, WriteTransaction};

type IdSource = Arc<dyn Fn() -> Uuid + Send + Sync>;

/// Executes student commands against SQLite, writing the outbox record in
/// the same transaction as the mutation.
#[derive(Clone)]
pub struct StudentCommandHandler {
    pool: SqlitePool,
    students: SqliteStudentStore,
    validator: Arc<dyn CodeTableValidator>,
    event_ids: IdSource,
}

impl StudentCommandHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            students: SqliteStudentStore::new(pool.clone()),
            pool,
            validator: Arc::new(CodeTables::new()),
            event_ids: Arc::new(Uuid::new_v4),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn CodeTableValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Source of outbox record ids.
    pub fn with_event_ids(mut self, ids: impl Fn() -> Uuid + Send + Sync + 'static) -> Self {
        self.event_ids = Arc::new(ids);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a student, or report `STUDENT_ALREADY_EXIST` when the PEN is taken.
    pub async fn create_student(
        &self,
        ctx: &CommandContext,
        draft: StudentDraft,
    ) -> Result<CommandOutcome<Student>> {
        self.validate(&draft).await?;
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = self.create_in(tx.conn()?, ctx, draft).await;
        tx.finish(result).await
    }

    pub async fn update_student(
        &self,
        ctx: &CommandContext,
        update: StudentUpdate,
    ) -> Result<CommandOutcome<Student>> {
        if update.fields.true_student_id == Some(update.student_id) {
            return Err(HandlerError::Validation(vec![
                "trueStudentId cannot reference the student itself".to_string(),
            ]));
        }
        self.validate(&update.fields).await?;
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = self.update_in(tx.conn()?, ctx, update).await;
        tx.finish(result).await
    }

    /// Delete a student and its history. The entity is the removed student.
    pub async fn delete_student(
        &self,
        ctx: &CommandContext,
        key: StudentKey,
    ) -> Result<CommandOutcome<Student>> {
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = self.delete_in(tx.conn()?, ctx, key).await;
        tx.finish(result).await
    }

    pub async fn create_student_history(
        &self,
        ctx: &CommandContext,
        request: StudentHistoryRequest,
    ) -> Result<CommandOutcome<StudentHistory>> {
        if request.history_activity_code.trim().is_empty() {
            return Err(HandlerError::Validation(vec![
                "historyActivityCode cannot be empty".to_string(),
            ]));
        }
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let result = self.history_in(tx.conn()?, ctx, request).await;
        tx.finish(result).await
    }

    /// Read-only lookup; never writes the outbox.
    pub async fn get_student(&self, key: &StudentKey) -> Result<(EventOutcome, Option<Student>)> {
        let student = self.students.find_by_id(key.student_id).await?;
        let outcome = if student.is_some() {
            EventOutcome::StudentFound
        } else {
            EventOutcome::StudentNotFound
        };
        Ok((outcome, student))
    }

    async fn validate(&self, draft: &StudentDraft) -> Result<()> {
        self.validator
            .validate(draft)
            .await
            .map_err(HandlerError::Validation)
    }

    async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &CommandContext,
        draft: StudentDraft,
    ) -> Result<CommandOutcome<Student>> {
        let now = Utc::now();
        let event_type = EventType::CreateStudent;
        if let Some(replay) = replay(conn, ctx, event_type, now).await? {
            return Ok(replay);
        }

        if let Some(existing) = SqliteStudentStore::find_by_pen_in(conn, &draft.pen).await? {
            debug!(pen = %draft.pen, student_id = %existing.student_id, "PEN already registered");
            return self
                .record(
                    conn,
                    ctx,
                    event_type,
                    EventOutcome::StudentAlreadyExist,
                    &existing,
                    Some(existing.clone()),
                    now,
                )
                .await;
        }

        let student = Student {
            student_id: Uuid::new_v4(),
            fields: draft,
            audit: Audit::created(&ctx.principal, now),
        };
        SqliteStudentStore::insert_in(conn, &student).await?;
        write_history(conn, &student, HISTORY_ACTIVITY_CREATE, &ctx.principal, now).await?;

        info!(student_id = %student.student_id, saga_id = ?ctx.saga_id, "Student created");
        self.record(
            conn,
            ctx,
            event_type,
            EventOutcome::StudentCreated,
            &student,
            Some(student.clone()),
            now,
        )
        .await
    }

    async fn update_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &CommandContext,
        update: StudentUpdate,
    ) -> Result<CommandOutcome<Student>> {
        let now = Utc::now();
        let event_type = EventType::UpdateStudent;
        if let Some(replay) = replay(conn, ctx, event_type, now).await? {
            return Ok(replay);
        }

        let Some(current) = SqliteStudentStore::find_in(conn, update.student_id).await? else {
            debug!(student_id = %update.student_id, "Update target not found");
            return self
                .record(conn, ctx, event_type, EventOutcome::StudentNotFound, &update, None, now)
                .await;
        };

        if let Some(true_student_id) = update.fields.true_student_id {
            if SqliteStudentStore::find_in(conn, true_student_id).await?.is_none() {
                debug!(true_student_id = %true_student_id, "Merge target not found");
                return self
                    .record(
                        conn,
                        ctx,
                        event_type,
                        EventOutcome::StudentNotFound,
                        &update,
                        None,
                        now,
                    )
                    .await;
            }
        }

        if update.fields.pen != current.fields.pen {
            let taken = SqliteStudentStore::find_by_pen_in(conn, &update.fields.pen).await?;
            if let Some(other) = taken {
                debug!(
                    pen = %update.fields.pen,
                    student_id = %other.student_id,
                    "PEN already registered"
                );
                return self
                    .record(
                        conn,
                        ctx,
                        event_type,
                        EventOutcome::StudentAlreadyExist,
                        &other,
                        Some(other.clone()),
                        now,
                    )
                    .await;
            }
        }

        let updated = Student {
            student_id: current.student_id,
            fields: update.fields,
            audit: current.audit.touched(&ctx.principal, now),
        };
        SqliteStudentStore::update_in(conn, &updated).await?;
        write_history(conn, &updated, HISTORY_ACTIVITY_EDIT, &ctx.principal, now).await?;

        info!(student_id = %updated.student_id, saga_id = ?ctx.saga_id, "Student updated");
        self.record(
            conn,
            ctx,
            event_type,
            EventOutcome::StudentUpdated,
            &updated,
            Some(updated.clone()),
            now,
        )
        .await
    }

    async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &CommandContext,
        key: StudentKey,
    ) -> Result<CommandOutcome<Student>> {
        let now = Utc::now();
        let event_type = EventType::DeleteStudent;
        if let Some(replay) = replay(conn, ctx, event_type, now).await? {
            return Ok(replay);
        }

        let Some(student) = SqliteStudentStore::find_in(conn, key.student_id).await? else {
            debug!(student_id = %key.student_id, "Delete target not found");
            return self
                .record(conn, ctx, event_type, EventOutcome::StudentNotFound, &key, None, now)
                .await;
        };

        let history_rows = SqliteStudentStore::delete_history_in(conn, student.student_id).await?;
        SqliteStudentStore::delete_in(conn, student.student_id).await?;

        info!(student_id = %student.student_id, history_rows, "Student deleted");
        self.record(
            conn,
            ctx,
            event_type,
            EventOutcome::StudentDeleted,
            &student,
            Some(student.clone()),
            now,
        )
        .await
    }

    async fn history_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &CommandContext,
        request: StudentHistoryRequest,
    ) -> Result<CommandOutcome<StudentHistory>> {
        let now = Utc::now();
        let event_type = EventType::CreateStudentHistory;
        if let Some(replay) = replay(conn, ctx, event_type, now).await? {
            return Ok(replay);
        }

        let Some(student) = SqliteStudentStore::find_in(conn, request.student_id).await? else {
            return self
                .record(conn, ctx, event_type, EventOutcome::StudentNotFound, &request, None, now)
                .await;
        };

        let history = write_history(
            conn,
            &student,
            &request.history_activity_code,
            &ctx.principal,
            now,
        )
        .await?;
        self.record(
            conn,
            ctx,
            event_type,
            EventOutcome::StudentHistoryCreated,
            &history,
            Some(history.clone()),
            now,
        )
        .await
    }

    /// Insert the outbox record for a handled command.
    #[allow(clippy::too_many_arguments)]
    async fn record<P: Serialize, T>(
        &self,
        conn: &mut SqliteConnection,
        ctx: &CommandContext,
        event_type: EventType,
        outcome: EventOutcome,
        payload: &P,
        entity: Option<T>,
        now: DateTime<Utc>,
    ) -> Result<CommandOutcome<T>> {
        let payload = serde_json::to_string(payload).map_err(StorageError::from)?;
        let record = EventRecord::new(
            (self.event_ids)(),
            ctx.saga_id,
            event_type,
            outcome,
            payload,
            &ctx.principal,
            now,
        )
        .with_reply_channel(ctx.reply_channel.clone());

        SqliteEventRecordStore::insert(conn, &record).await?;
        debug!(
            event_id = %record.event_id,
            event_type = %event_type,
            outcome = %outcome,
            "Outbox record written"
        );

        Ok(CommandOutcome {
            entity,
            record,
            replayed: false,
        })
    }
}

/// Return the recorded outcome when this saga already ran this command.
async fn replay<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    ctx: &CommandContext,
    event_type: EventType,
    now: DateTime<Utc>,
) -> Result<Option<CommandOutcome<T>>> {
    let Some(saga_id) = ctx.saga_id else {
        return Ok(None);
    };
    let Some(mut record) =
        SqliteEventRecordStore::find_by_saga_and_type_in(conn, saga_id, event_type).await?
    else {
        return Ok(None);
    };

    SqliteEventRecordStore::touch_in(conn, record.event_id, &ctx.principal, now).await?;
    record.updated_by = ctx.principal.clone();
    record.updated_at = now;

    info!(
        saga_id = %saga_id,
        event_type = %event_type,
        event_id = %record.event_id,
        "Duplicate command, returning recorded outcome"
    );
    Ok(Some(CommandOutcome {
        entity: serde_json::from_str(&record.event_payload).ok(),
        record,
        replayed: true,
    }))
}

async fn write_history(
    conn: &mut SqliteConnection,
    student: &Student,
    activity: &str,
    principal: &str,
    now: DateTime<Utc>,
) -> Result<StudentHistory> {
    let history = StudentHistory::of(student, activity, Uuid::new_v4(), principal, now);
    SqliteStudentStore::insert_history_in(conn, &history).await?;
    Ok(history)
}
