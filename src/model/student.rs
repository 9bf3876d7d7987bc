//! Student domain records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// History activity code written when a student is created.
pub const HISTORY_ACTIVITY_CREATE: &str = "REQ_NEW";
/// History activity code written when a student is edited.
pub const HISTORY_ACTIVITY_EDIT: &str = "USER_EDIT";

/// Audit columns, assigned explicitly by the command handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    /// Stamp for a freshly created row.
    pub fn created(principal: &str, now: DateTime<Utc>) -> Self {
        Self {
            created_by: principal.to_string(),
            created_at: now,
            updated_by: principal.to_string(),
            updated_at: now,
        }
    }

    /// Keep the creation stamp, move the update stamp.
    pub fn touched(&self, principal: &str, now: DateTime<Utc>) -> Self {
        Self {
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_by: principal.to_string(),
            updated_at: now,
        }
    }
}

/// Student fields supplied by a create or update request.
///
/// Already validated and authorized by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StudentDraft {
    /// Personal Education Number, unique across students.
    pub pen: String,
    pub legal_first_name: Option<String>,
    pub legal_middle_names: Option<String>,
    pub legal_last_name: String,
    pub usual_first_name: Option<String>,
    pub usual_last_name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub sex_code: Option<String>,
    pub gender_code: Option<String>,
    pub email: Option<String>,
    pub postal_code: Option<String>,
    pub mincode: Option<String>,
    pub grade_code: Option<String>,
    pub status_code: Option<String>,
    /// Surviving student when this record was merged into another.
    pub true_student_id: Option<Uuid>,
}

/// Persisted student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub student_id: Uuid,
    #[serde(flatten)]
    pub fields: StudentDraft,
    #[serde(flatten)]
    pub audit: Audit,
}

impl Student {
    pub fn pen(&self) -> &str {
        &self.fields.pen
    }

    /// Whether this record has been merged into another student.
    pub fn is_merged(&self) -> bool {
        self.fields.true_student_id.is_some()
    }
}

/// Update request: target id plus replacement fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentUpdate {
    pub student_id: Uuid,
    #[serde(flatten)]
    pub fields: StudentDraft,
}

/// Lookup request carried by `GET_STUDENT` and `DELETE_STUDENT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentKey {
    pub student_id: Uuid,
}

/// Point-in-time copy of a student, written on every create and edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHistory {
    pub student_history_id: Uuid,
    pub student_id: Uuid,
    pub history_activity_code: String,
    #[serde(flatten)]
    pub snapshot: StudentDraft,
    #[serde(flatten)]
    pub audit: Audit,
}

impl StudentHistory {
    /// Snapshot the given student under an activity code.
    pub fn of(
        student: &Student,
        activity: &str,
        history_id: Uuid,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            student_history_id: history_id,
            student_id: student.student_id,
            history_activity_code: activity.to_string(),
            snapshot: student.fields.clone(),
            audit: Audit::created(principal, now),
        }
    }
}

/// Explicit history entry requested via `CREATE_STUDENT_HISTORY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHistoryRequest {
    pub student_id: Uuid,
    pub history_activity_code: String,
}
