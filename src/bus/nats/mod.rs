//! NATS JetStream transport.
//!
//! - Fan-out and acknowledgment subjects live in one JetStream stream; the
//!   service publishes with `publish` + ack-future so a success means the
//!   server persisted the message
//! - Durable subscriptions are pull consumers named by configuration
//!   (`AckPolicy::Explicit`); the name is the consumer group, so instances
//!   share the load and resume from the stored position after a restart
//! - The command subject uses a core NATS queue group, keeping request/reply
//!   inboxes intact
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   type: nats
//!   nats:
//!     url: "nats://localhost:4222"
//!     stream_name: "STUDENT_EVENTS"
//!     ack_wait_secs: 30
//!   topics:
//!     command: "STUDENT_API_TOPIC"
//!     command_group: "student-api"
//!     events: "STUDENT_EVENTS_TOPIC"
//!     acks: "STUDENT_EVENTS_ACK_TOPIC"
//!     acks_durable: "student-outbox-acks"
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    Acker, BrokerConnection, BusError, Connector, Delivery, DeliveryStream, InboundMessage, Result,
    SubscriptionSpec,
};
use crate::config::{NatsSettings, TopicsConfig};

/// Opens NATS sessions and makes sure the JetStream stream exists.
pub struct NatsConnector {
    settings: NatsSettings,
    topics: TopicsConfig,
}

impl NatsConnector {
    pub fn new(settings: NatsSettings, topics: TopicsConfig) -> Self {
        Self { settings, topics }
    }

    /// Subjects persisted by the stream.
    pub fn stream_subjects(&self) -> Vec<String> {
        let mut subjects = vec![self.topics.events.clone(), self.topics.acks.clone()];
        subjects.dedup();
        subjects
    }

    pub fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.settings.stream_name.clone(),
            subjects: self.stream_subjects(),
            max_age: Duration::from_secs(self.settings.stream_max_age_secs),
            ..Default::default()
        }
    }

    async fn connect_options(&self, closed: Arc<watch::Sender<bool>>) -> Result<ConnectOptions> {
        let options = match &self.settings.credentials_file {
            Some(path) => ConnectOptions::with_credentials_file(path.clone())
                .await
                .map_err(|e| BusError::Connection(format!("Failed to read {}: {}", path, e)))?,
            None => ConnectOptions::new(),
        };

        Ok(options
            .name(&self.settings.connection_name)
            .connection_timeout(Duration::from_millis(self.settings.connect_timeout_ms))
            .event_callback(move |event| {
                let closed = closed.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            warn!("NATS disconnected");
                            closed.send_replace(true);
                        }
                        Event::Connected => debug!("NATS connected"),
                        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
                        _ => {}
                    }
                }
            }))
    }
}

/// Pull consumer settings for a durable subscription.
pub fn consumer_config(spec: &SubscriptionSpec, ack_wait: Duration) -> pull::Config {
    pull::Config {
        durable_name: Some(spec.group.clone()),
        filter_subject: spec.subject.clone(),
        ack_policy: AckPolicy::Explicit,
        ack_wait,
        ..Default::default()
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let client = self
            .connect_options(closed_tx.clone())
            .await?
            .connect(self.settings.url.as_str())
            .await
            .map_err(|e| {
                BusError::Connection(format!("Failed to connect to {}: {}", self.settings.url, e))
            })?;

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(self.stream_config())
            .await
            .map_err(|e| {
                BusError::Connection(format!(
                    "Failed to ensure stream {}: {}",
                    self.settings.stream_name, e
                ))
            })?;

        info!(
            url = %self.settings.url,
            stream = %self.settings.stream_name,
            "Connected to NATS JetStream"
        );

        Ok(Arc::new(NatsConnection {
            client,
            jetstream,
            stream_name: self.settings.stream_name.clone(),
            ack_wait: Duration::from_secs(self.settings.ack_wait_secs),
            closed_tx,
            closed_rx,
        }))
    }
}

struct NatsConnection {
    client: Client,
    jetstream: jetstream::Context,
    stream_name: String,
    ack_wait: Duration,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl NatsConnection {
    async fn subscribe_durable(&self, spec: &SubscriptionSpec) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::Subscribe(format!("stream {}: {}", self.stream_name, e)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(&spec.group, consumer_config(spec, self.ack_wait))
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", spec.group, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {}: {}", spec.group, e)))?;

        Ok(messages
            .filter_map(|item| async move {
                match item {
                    Ok(message) => Some(jetstream_delivery(message)),
                    Err(e) => {
                        warn!(error = %e, "JetStream delivery error");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn subscribe_queue(&self, spec: &SubscriptionSpec) -> Result<DeliveryStream> {
        let subscriber = self
            .client
            .queue_subscribe(spec.subject.clone(), spec.group.clone())
            .await
            .map_err(|e| BusError::Subscribe(format!("{}: {}", spec.subject, e)))?;

        Ok(subscriber
            .map(|message| {
                Delivery::new(InboundMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|reply| reply.to_string()),
                    payload: message.payload,
                })
            })
            .boxed())
    }
}

fn jetstream_delivery(message: jetstream::Message) -> Delivery {
    let inbound = InboundMessage {
        subject: message.subject.to_string(),
        reply: None,
        payload: message.payload.clone(),
    };
    Delivery::new(inbound).with_acker(Box::new(NatsAcker { message }))
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        ack.await.map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<DeliveryStream> {
        if spec.durable {
            self.subscribe_durable(spec).await
        } else {
            self.subscribe_queue(spec).await
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.closed_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests;
