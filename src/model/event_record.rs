//! The outbox row and its closed enumerations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of an outbox record.
///
/// Advances `DbCommitted` -> `MessagePublished` and never regresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Committed together with the business mutation, not yet confirmed delivered.
    #[default]
    DbCommitted,
    /// Delivery confirmed (publish-ack or downstream acknowledgment).
    MessagePublished,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::DbCommitted => "DB_COMMITTED",
            EventStatus::MessagePublished => "MESSAGE_PUBLISHED",
        }
    }

    /// Whether moving from `self` to `next` respects the one-way lifecycle.
    pub fn can_advance_to(&self, next: EventStatus) -> bool {
        !matches!(
            (self, next),
            (EventStatus::MessagePublished, EventStatus::DbCommitted)
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DB_COMMITTED" | "PENDING" => Ok(EventStatus::DbCommitted),
            "MESSAGE_PUBLISHED" | "PUBLISHED" => Ok(EventStatus::MessagePublished),
            other => Err(UnknownVariant::new("EventStatus", other)),
        }
    }
}

/// Error returned when parsing a stored enum value fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Wire/storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// All known variants.
            pub fn all() -> &'static [$name] {
                &[$($name::$variant,)+]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant::new(stringify!($name), other)),
                }
            }
        }
    };
}

wire_enum! {
    /// Kind of command or notification carried by an event.
    EventType {
        CreateStudent => "CREATE_STUDENT",
        UpdateStudent => "UPDATE_STUDENT",
        DeleteStudent => "DELETE_STUDENT",
        GetStudent => "GET_STUDENT",
        CreateStudentHistory => "CREATE_STUDENT_HISTORY",
        GetPaginatedStudentByCriteria => "GET_PAGINATED_STUDENT_BY_CRITERIA",
        OutboxProcessed => "OUTBOX_PROCESSED",
    }
}

wire_enum! {
    /// Result of handling an event.
    EventOutcome {
        StudentCreated => "STUDENT_CREATED",
        StudentAlreadyExist => "STUDENT_ALREADY_EXIST",
        StudentNotFound => "STUDENT_NOT_FOUND",
        StudentFound => "STUDENT_FOUND",
        StudentUpdated => "STUDENT_UPDATED",
        StudentDeleted => "STUDENT_DELETED",
        StudentHistoryCreated => "STUDENT_HISTORY_CREATED",
        ValidationFailed => "VALIDATION_FAILED",
    }
}

/// Outbox row: the durable record that a business fact still has to be announced.
///
/// Payload bytes are fixed at creation; only the status, the publish stamp and
/// the `updated_*` audit columns change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_id: Uuid,
    pub saga_id: Option<Uuid>,
    pub event_type: EventType,
    pub event_outcome: Option<EventOutcome>,
    pub event_payload: String,
    pub event_status: EventStatus,
    pub reply_channel: Option<String>,
    /// Last time the poller handed the record to the transport (deferred-ack mode).
    pub published_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a new `DbCommitted` record with explicit audit stamps.
    pub fn new(
        event_id: Uuid,
        saga_id: Option<Uuid>,
        event_type: EventType,
        event_outcome: EventOutcome,
        event_payload: String,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            saga_id,
            event_type,
            event_outcome: Some(event_outcome),
            event_payload,
            event_status: EventStatus::DbCommitted,
            reply_channel: None,
            published_at: None,
            created_by: principal.to_string(),
            created_at: now,
            updated_by: principal.to_string(),
            updated_at: now,
        }
    }

    pub fn with_reply_channel(mut self, reply_channel: Option<String>) -> Self {
        self.reply_channel = reply_channel;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.event_status == EventStatus::DbCommitted
    }

    pub fn is_published(&self) -> bool {
        self.event_status == EventStatus::MessagePublished
    }
}
