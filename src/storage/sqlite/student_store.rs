//! SQLite student and student history persistence.
//!
//! Write operations take the connection of an open [`WriteTransaction`] so the
//! command handlers can pair them with the outbox insert.
//!
//! [`WriteTransaction`]: super::WriteTransaction

use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::model::{Audit, Student, StudentDraft, StudentHistory};
use crate::storage::schema::{StudentHistories, Students};
use crate::storage::{format_timestamp, parse_timestamp, parse_uuid, Result};

/// SQLite access to the student tables.
#[derive(Clone)]
pub struct SqliteStudentStore {
    pool: SqlitePool,
}

impl SqliteStudentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, student_id: Uuid) -> Result<Option<Student>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_in(&mut conn, student_id).await
    }

    pub async fn find_by_pen(&self, pen: &str) -> Result<Option<Student>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_by_pen_in(&mut conn, pen).await
    }

    /// History rows for a student, oldest first.
    pub async fn history_for(&self, student_id: Uuid) -> Result<Vec<StudentHistory>> {
        let query = Query::select()
            .columns([
                StudentHistories::StudentHistoryId,
                StudentHistories::StudentId,
                StudentHistories::HistoryActivityCode,
                StudentHistories::Snapshot,
                StudentHistories::CreatedBy,
                StudentHistories::CreatedAt,
                StudentHistories::UpdatedBy,
                StudentHistories::UpdatedAt,
            ])
            .from(StudentHistories::Table)
            .and_where(Expr::col(StudentHistories::StudentId).eq(student_id.to_string()))
            .order_by(StudentHistories::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(history_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let query = Query::select()
            .expr(Expr::col(Students::StudentId).count())
            .from(Students::Table)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    pub async fn find_in(conn: &mut SqliteConnection, student_id: Uuid) -> Result<Option<Student>> {
        let query = select_students()
            .and_where(Expr::col(Students::StudentId).eq(student_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(student_from_row).transpose()
    }

    pub async fn find_by_pen_in(conn: &mut SqliteConnection, pen: &str) -> Result<Option<Student>> {
        let query = select_students()
            .and_where(Expr::col(Students::Pen).eq(pen))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(student_from_row).transpose()
    }

    pub async fn insert_in(conn: &mut SqliteConnection, student: &Student) -> Result<()> {
        let query = Query::insert()
            .into_table(Students::Table)
            .columns([
                Students::StudentId,
                Students::Pen,
                Students::TrueStudentId,
                Students::Data,
                Students::CreatedBy,
                Students::CreatedAt,
                Students::UpdatedBy,
                Students::UpdatedAt,
            ])
            .values_panic([
                student.student_id.to_string().into(),
                student.fields.pen.clone().into(),
                student.fields.true_student_id.map(|id| id.to_string()).into(),
                serde_json::to_string(&student.fields)?.into(),
                student.audit.created_by.clone().into(),
                format_timestamp(student.audit.created_at).into(),
                student.audit.updated_by.clone().into(),
                format_timestamp(student.audit.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    /// Replace the fields and update stamp of an existing student.
    pub async fn update_in(conn: &mut SqliteConnection, student: &Student) -> Result<bool> {
        let query = Query::update()
            .table(Students::Table)
            .values([
                (Students::Pen, student.fields.pen.clone().into()),
                (
                    Students::TrueStudentId,
                    student.fields.true_student_id.map(|id| id.to_string()).into(),
                ),
                (Students::Data, serde_json::to_string(&student.fields)?.into()),
                (Students::UpdatedBy, student.audit.updated_by.clone().into()),
                (Students::UpdatedAt, format_timestamp(student.audit.updated_at).into()),
            ])
            .and_where(Expr::col(Students::StudentId).eq(student.student_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_in(conn: &mut SqliteConnection, student_id: Uuid) -> Result<bool> {
        let query = Query::delete()
            .from_table(Students::Table)
            .and_where(Expr::col(Students::StudentId).eq(student_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_history_in(
        conn: &mut SqliteConnection,
        history: &StudentHistory,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(StudentHistories::Table)
            .columns([
                StudentHistories::StudentHistoryId,
                StudentHistories::StudentId,
                StudentHistories::HistoryActivityCode,
                StudentHistories::Snapshot,
                StudentHistories::CreatedBy,
                StudentHistories::CreatedAt,
                StudentHistories::UpdatedBy,
                StudentHistories::UpdatedAt,
            ])
            .values_panic([
                history.student_history_id.to_string().into(),
                history.student_id.to_string().into(),
                history.history_activity_code.clone().into(),
                serde_json::to_string(&history.snapshot)?.into(),
                history.audit.created_by.clone().into(),
                format_timestamp(history.audit.created_at).into(),
                history.audit.updated_by.clone().into(),
                format_timestamp(history.audit.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn delete_history_in(conn: &mut SqliteConnection, student_id: Uuid) -> Result<u64> {
        let query = Query::delete()
            .from_table(StudentHistories::Table)
            .and_where(Expr::col(StudentHistories::StudentId).eq(student_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}

fn select_students() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Students::StudentId,
            Students::Data,
            Students::CreatedBy,
            Students::CreatedAt,
            Students::UpdatedBy,
            Students::UpdatedAt,
        ])
        .from(Students::Table)
        .to_owned()
}

fn audit_from_row(row: &SqliteRow) -> Result<Audit> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Audit {
        created_by: row.try_get("created_by")?,
        created_at: parse_timestamp(&created_at)?,
        updated_by: row.try_get("updated_by")?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn student_from_row(row: &SqliteRow) -> Result<Student> {
    let student_id: String = row.try_get("student_id")?;
    let data: String = row.try_get("data")?;
    let fields: StudentDraft = serde_json::from_str(&data)?;
    Ok(Student {
        student_id: parse_uuid(&student_id)?,
        fields,
        audit: audit_from_row(row)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<StudentHistory> {
    let history_id: String = row.try_get("student_history_id")?;
    let student_id: String = row.try_get("student_id")?;
    let snapshot: String = row.try_get("snapshot")?;
    Ok(StudentHistory {
        student_history_id: parse_uuid(&history_id)?,
        student_id: parse_uuid(&student_id)?,
        history_activity_code: row.try_get("history_activity_code")?,
        snapshot: serde_json::from_str(&snapshot)?,
        audit: audit_from_row(row)?,
    })
}
