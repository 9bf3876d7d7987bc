//! Student command handlers.
//!
//! Every mutation runs in one write transaction together with the insert of
//! its outbox record. Business failures (missing student, duplicate PEN) are
//! outcomes, recorded and announced like successes; only infrastructure and
//! validation failures are errors.

use uuid::Uuid;

use crate::model::{DecodeError, EventRecord};
use crate::storage::StorageError;

mod student;
pub mod validator;

pub use student::StudentCommandHandler;
pub use validator::{CodeTableValidator, CodeTables};

/// Errors from command handling.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid request: {0}")]
    Decode(#[from] DecodeError),
}

impl HandlerError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Storage(StorageError::Database(_)))
    }
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// Request metadata carried into the outbox record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    /// Saga or correlation id; enables the duplicate-command check.
    pub saga_id: Option<Uuid>,
    /// Where the direct reply goes once the record is published.
    pub reply_channel: Option<String>,
    /// Written to the audit columns.
    pub principal: String,
}

impl CommandContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            saga_id: None,
            reply_channel: None,
            principal: principal.into(),
        }
    }

    pub fn with_saga(mut self, saga_id: Option<Uuid>) -> Self {
        self.saga_id = saga_id;
        self
    }

    pub fn with_reply_channel(mut self, reply_channel: Option<String>) -> Self {
        self.reply_channel = reply_channel;
        self
    }
}

/// Entity and outbox record produced by one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome<T> {
    pub entity: Option<T>,
    pub record: EventRecord,
    /// The command was a duplicate; `record` is the one written the first time.
    pub replayed: bool,
}
