//! Message transport.
//!
//! This module contains:
//! - `MessageTransport` trait: what publishers and the dispatcher use
//! - `Connector` / `BrokerConnection` traits: one broker session, replaced on loss
//! - `ManagedTransport`: owns the session, reconnects with backoff, restores subscriptions
//! - Implementations: NATS JetStream, in-memory channel broker, Mock

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{Config, MessagingType};

// Implementation modules
#[cfg(feature = "channel")]
pub mod channel;
pub mod managed;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "channel")]
pub use channel::{ChannelBroker, ChannelConnector, SentMessage, SentKind};
pub use managed::{ManagedTransport, TransportSettings};
pub use mock::{MockCall, MockTransport};
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

// ============================================================================
// Errors and message types
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport closed")]
    Closed,
}

/// Lifecycle of the managed broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What to subscribe to and under which consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSpec {
    pub subject: String,
    /// Queue group or durable consumer name. Instances sharing it share the load.
    pub group: String,
    /// Durable subscriptions persist their position and require explicit acks.
    pub durable: bool,
}

impl SubscriptionSpec {
    /// Load-balanced, non-persistent subscription (request/reply commands).
    pub fn queue(subject: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            group: group.into(),
            durable: false,
        }
    }

    /// Persistent named consumer with explicit acknowledgment.
    pub fn durable(subject: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            group: name.into(),
            durable: true,
        }
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    /// Reply inbox set by a requesting client.
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Settles a durable delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Ask the broker to redeliver.
    async fn nak(&self) -> Result<()>;
}

/// An inbound message plus, for durable subscriptions, its acker.
pub struct Delivery {
    pub message: InboundMessage,
    pub acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            message,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("acked", &self.acker.is_some())
            .finish()
    }
}

/// Stream of deliveries for one subscription on one connection.
pub type DeliveryStream = BoxStream<'static, Delivery>;

// ============================================================================
// Traits
// ============================================================================

/// Handler for messages received on a subscription.
///
/// `Ok` acknowledges a durable delivery, `Err` asks for redelivery.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, Result<()>>;
}

/// One live broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Durable publish; returns once the broker has accepted the message.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Point-to-point reply to a request inbox.
    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<DeliveryStream>;

    /// Resolves when the session is lost.
    async fn closed(&self);

    async fn close(&self);
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// Connection-managed transport used by the poller and the dispatcher.
///
/// Publish failures mean "not yet delivered", never "delivered".
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Register a subscription; it survives reconnects.
    async fn subscribe(&self, spec: SubscriptionSpec, handler: Arc<dyn MessageHandler>)
        -> Result<()>;

    fn state(&self) -> ConnectionState;

    async fn close(&self);
}

// ============================================================================
// Factory
// ============================================================================

/// Build the connector named by `messaging.type`.
pub fn init_connector(config: &Config) -> Result<Arc<dyn Connector>> {
    match config.messaging.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                info!(messaging_type = "channel", "Using in-memory broker");
                Ok(Arc::new(ChannelConnector::new(ChannelBroker::new())))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err(BusError::Connection(
                    "Channel broker requires the 'channel' feature".to_string(),
                ))
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                info!(messaging_type = "nats", url = %config.messaging.nats.url, "Using NATS JetStream");
                Ok(Arc::new(NatsConnector::new(
                    config.messaging.nats.clone(),
                    config.messaging.topics.clone(),
                )))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err(BusError::Connection(
                    "NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests;
