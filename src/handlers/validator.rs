//! Referential validation against code tables.
//!
//! The caller has already validated and authorized the request; this seam only
//! checks that coded fields refer to known code-table entries.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::model::StudentDraft;

/// Error constants for validation failures.
pub mod errmsg {
    pub const PEN_EMPTY: &str = "pen cannot be empty";
    pub const LEGAL_LAST_NAME_EMPTY: &str = "legalLastName cannot be empty";
    pub const SEX_CODE_UNKNOWN: &str = "sexCode is not a known code";
    pub const GENDER_CODE_UNKNOWN: &str = "genderCode is not a known code";
    pub const GRADE_CODE_UNKNOWN: &str = "gradeCode is not a known code";
    pub const STATUS_CODE_UNKNOWN: &str = "statusCode is not a known code";
}

/// Read-only lookups consulted by create and update.
#[async_trait]
pub trait CodeTableValidator: Send + Sync {
    /// Returns every violation found, or `Ok` when the draft is acceptable.
    async fn validate(&self, draft: &StudentDraft) -> Result<(), Vec<String>>;
}

/// In-memory code tables. An empty table accepts any value.
#[derive(Debug, Clone, Default)]
pub struct CodeTables {
    sex_codes: HashSet<String>,
    gender_codes: HashSet<String>,
    grade_codes: HashSet<String>,
    status_codes: HashSet<String>,
}

fn codes<I, S>(values: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl CodeTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sex_codes<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sex_codes = codes(values);
        self
    }

    pub fn with_gender_codes<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gender_codes = codes(values);
        self
    }

    pub fn with_grade_codes<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grade_codes = codes(values);
        self
    }

    pub fn with_status_codes<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.status_codes = codes(values);
        self
    }
}

fn check(table: &HashSet<String>, value: &Option<String>, message: &str, errors: &mut Vec<String>) {
    if let Some(value) = value {
        if !table.is_empty() && !table.contains(value) {
            errors.push(format!("{}: {}", message, value));
        }
    }
}

#[async_trait]
impl CodeTableValidator for CodeTables {
    async fn validate(&self, draft: &StudentDraft) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if draft.pen.trim().is_empty() {
            errors.push(errmsg::PEN_EMPTY.to_string());
        }
        if draft.legal_last_name.trim().is_empty() {
            errors.push(errmsg::LEGAL_LAST_NAME_EMPTY.to_string());
        }
        check(&self.sex_codes, &draft.sex_code, errmsg::SEX_CODE_UNKNOWN, &mut errors);
        check(&self.gender_codes, &draft.gender_code, errmsg::GENDER_CODE_UNKNOWN, &mut errors);
        check(&self.grade_codes, &draft.grade_code, errmsg::GRADE_CODE_UNKNOWN, &mut errors);
        check(&self.status_codes, &draft.status_code, errmsg::STATUS_CODE_UNKNOWN, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
