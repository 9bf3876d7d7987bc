//! JSON wire envelopes.
//!
//! `Event` is what travels on command, reply and fan-out subjects.
//! `ChoreographedEvent` is the fan-out copy; it is the only envelope that
//! exposes the outbox `eventID`, so subscribers can acknowledge it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event_record::{EventOutcome, EventRecord, EventType};

/// Current payload version stamped on outbound envelopes.
pub const PAYLOAD_VERSION: &str = "V1";

/// Errors decoding an inbound envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope payload is not valid for {event_type}: {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
}

/// Request/response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: EventType,
    #[serde(default)]
    pub event_outcome: Option<EventOutcome>,
    #[serde(default = "default_payload_version")]
    pub payload_version: String,
    #[serde(default)]
    pub saga_id: Option<Uuid>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub event_payload: String,
}

fn default_payload_version() -> String {
    PAYLOAD_VERSION.to_string()
}

impl Event {
    pub fn new(event_type: EventType, saga_id: Option<Uuid>, event_payload: String) -> Self {
        Self {
            event_type,
            event_outcome: None,
            payload_version: default_payload_version(),
            saga_id,
            reply_to: None,
            event_payload,
        }
    }

    /// Response envelope for a handled request.
    pub fn response(
        request: &Event,
        event_outcome: EventOutcome,
        event_payload: String,
    ) -> Self {
        Self {
            event_type: request.event_type,
            event_outcome: Some(event_outcome),
            payload_version: default_payload_version(),
            saga_id: request.saga_id,
            reply_to: None,
            event_payload,
        }
    }

    /// Envelope carried by the direct reply for an outbox record.
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_type: record.event_type,
            event_outcome: record.event_outcome,
            payload_version: default_payload_version(),
            saga_id: record.saga_id,
            reply_to: None,
            event_payload: record.event_payload.clone(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Decode the payload as a typed request body.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_str(&self.event_payload).map_err(|source| DecodeError::Payload {
            event_type: self.event_type,
            source,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Fan-out copy of an outbox record, tagged with its `eventID`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoreographedEvent {
    #[serde(rename = "eventID")]
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(default)]
    pub event_outcome: Option<EventOutcome>,
    #[serde(default = "default_payload_version")]
    pub payload_version: String,
    #[serde(default)]
    pub saga_id: Option<Uuid>,
    #[serde(default)]
    pub event_payload: String,
}

impl ChoreographedEvent {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type,
            event_outcome: record.event_outcome,
            payload_version: default_payload_version(),
            saga_id: record.saga_id,
            event_payload: record.event_payload.clone(),
        }
    }

    /// The acknowledgment a subscriber sends back once it has processed this copy.
    pub fn acknowledgment(&self) -> Event {
        Event::new(
            EventType::OutboxProcessed,
            self.saga_id,
            self.event_id.to_string(),
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Inbound envelope whose `eventType` may be one this build does not know.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_type: String,
    #[serde(default)]
    event_outcome: Option<EventOutcome>,
    #[serde(default = "default_payload_version")]
    payload_version: String,
    #[serde(default)]
    saga_id: Option<Uuid>,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    event_payload: String,
}

/// Result of decoding an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(Event),
    /// Well-formed envelope with an event type this build does not handle.
    Unsupported { event_type: String, saga_id: Option<Uuid> },
}

/// Decode an inbound envelope, separating unknown event types from malformed input.
pub fn decode_event(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let raw: RawEvent = serde_json::from_slice(bytes)?;
    match raw.event_type.parse::<EventType>() {
        Ok(event_type) => Ok(Decoded::Known(Event {
            event_type,
            event_outcome: raw.event_outcome,
            payload_version: raw.payload_version,
            saga_id: raw.saga_id,
            reply_to: raw.reply_to,
            event_payload: raw.event_payload,
        })),
        Err(_) => Ok(Decoded::Unsupported {
            event_type: raw.event_type,
            saga_id: raw.saga_id,
        }),
    }
}
