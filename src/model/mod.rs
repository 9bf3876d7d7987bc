//! Domain and wire types.
//!
//! - `EventRecord`: the outbox row and its status/type/outcome enumerations
//! - `Student`, `StudentHistory`: the business rows the handlers mutate
//! - `Event`, `ChoreographedEvent`: JSON envelopes on the wire

pub mod envelope;
pub mod event_record;
pub mod student;

pub use envelope::{decode_event, ChoreographedEvent, DecodeError, Decoded, Event, PAYLOAD_VERSION};
pub use event_record::{EventOutcome, EventRecord, EventStatus, EventType, UnknownVariant};
pub use student::{
    Audit, Student, StudentDraft, StudentHistory, StudentHistoryRequest, StudentKey, StudentUpdate,
    HISTORY_ACTIVITY_CREATE, HISTORY_ACTIVITY_EDIT,
};

#[cfg(test)]
mod tests;
