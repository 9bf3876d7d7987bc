//! Messaging configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-memory broker (no external broker).
    #[default]
    Channel,
    /// NATS with JetStream.
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// NATS-specific configuration.
    pub nats: NatsSettings,
    /// Subject and consumer-group names.
    pub topics: TopicsConfig,
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    /// Server URL(s), comma separated.
    pub url: String,
    /// Client name reported to the server.
    pub connection_name: String,
    /// Optional `.creds` file.
    pub credentials_file: Option<String>,
    pub connect_timeout_ms: u64,
    /// JetStream stream holding the fan-out and acknowledgment subjects.
    pub stream_name: String,
    /// Retention horizon for the stream.
    pub stream_max_age_secs: u64,
    /// How long the server waits for an explicit ack before redelivering.
    pub ack_wait_secs: u64,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connection_name: "student-outbox".to_string(),
            credentials_file: None,
            connect_timeout_ms: 5_000,
            stream_name: "STUDENT_EVENTS".to_string(),
            stream_max_age_secs: 7 * 24 * 3600,
            ack_wait_secs: 30,
        }
    }
}

/// Subject and consumer-group names.
///
/// These must stay stable across deployments: durable consumers resume from
/// their stored position only when the names match.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Inbound command subject (request/reply).
    pub command: String,
    /// Queue group shared by all instances consuming `command`.
    pub command_group: String,
    /// Fan-out subject for choreography subscribers.
    pub events: String,
    /// Subject carrying `OUTBOX_PROCESSED` acknowledgments.
    pub acks: String,
    /// Durable consumer name for `acks`.
    pub acks_durable: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            command: "STUDENT_API_TOPIC".to_string(),
            command_group: "student-api".to_string(),
            events: "STUDENT_EVENTS_TOPIC".to_string(),
            acks: "STUDENT_EVENTS_ACK_TOPIC".to_string(),
            acks_durable: "student-outbox-acks".to_string(),
        }
    }
}
