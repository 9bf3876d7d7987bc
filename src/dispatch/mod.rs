//! Inbound event dispatch.
//!
//! Commands arrive on the command topic, acknowledgments on the acks topic.
//! Both are decoded into an [`Event`] and routed through a [`DispatchTable`]
//! keyed by [`EventType`]; adding an event type is one `register` call.
//!
//! # Outcomes
//!
//! - Mutations commit their outbox record and, with publish-on-commit, hand it
//!   straight to the poller. The scheduled poller remains the guarantee.
//! - Queries reply directly on the request's reply channel.
//! - Unknown event types are logged and ignored.
//! - Malformed envelopes are logged and dropped, never redelivered.
//! - Storage failures are returned as errors so durable deliveries are nak'd.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, InboundMessage, MessageHandler, MessageTransport, SubscriptionSpec};
use crate::config::TopicsConfig;
use crate::handlers::{self, CommandContext, HandlerError, StudentCommandHandler};
use crate::model::{
    decode_event, Decoded, Event, EventOutcome, EventRecord, EventType, StudentDraft,
    StudentHistoryRequest, StudentKey, StudentUpdate,
};
use crate::outbox::{OutboxPoller, StatusReconciler};
use crate::storage::StorageError;

/// What a handled event asks the dispatcher to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// A mutation committed this outbox record.
    Committed(EventRecord),
    /// Send this envelope on the request's reply channel.
    Reply(Event),
    /// Nothing further.
    Done,
}

/// Handler registered for one event type.
pub trait EventTypeHandler: Send + Sync {
    fn handle(&self, event: Event) -> BoxFuture<'static, handlers::Result<Reaction>>;
}

impl<F, Fut> EventTypeHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = handlers::Result<Reaction>> + Send + 'static,
{
    fn handle(&self, event: Event) -> BoxFuture<'static, handlers::Result<Reaction>> {
        Box::pin(self(event))
    }
}

/// Event type to handler registrations, built once at startup.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<EventType, Arc<dyn EventTypeHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any earlier registration.
    pub fn register<H>(&mut self, event_type: EventType, handler: H) -> &mut Self
    where
        H: EventTypeHandler + 'static,
    {
        self.handlers.insert(event_type, Arc::new(handler));
        self
    }

    pub fn get(&self, event_type: EventType) -> Option<Arc<dyn EventTypeHandler>> {
        self.handlers.get(&event_type).cloned()
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn context(event: &Event, principal: &str) -> CommandContext {
    CommandContext::new(principal)
        .with_saga(event.saga_id)
        .with_reply_channel(event.reply_to.clone())
}

/// A first-time command commits; a duplicate is answered from the record
/// written the first time.
fn committed<T>(outcome: handlers::CommandOutcome<T>) -> Reaction {
    if outcome.replayed {
        Reaction::Reply(Event::from_record(&outcome.record))
    } else {
        Reaction::Committed(outcome.record)
    }
}

/// The outbox id carried by an `OUTBOX_PROCESSED` payload, bare or JSON-quoted.
fn acknowledged_id(event: &Event) -> handlers::Result<Uuid> {
    match Uuid::parse_str(event.event_payload.trim()) {
        Ok(id) => Ok(id),
        Err(_) => Ok(event.payload::<Uuid>()?),
    }
}

/// Registrations for the student service.
///
/// `GET_PAGINATED_STUDENT_BY_CRITERIA` is deliberately absent; it is logged
/// and ignored like any unregistered type.
pub fn student_table(
    handler: StudentCommandHandler,
    reconciler: Arc<StatusReconciler>,
    principal: impl Into<String>,
) -> DispatchTable {
    let principal: Arc<str> = Arc::from(principal.into());
    let mut table = DispatchTable::new();

    let (h, p) = (handler.clone(), principal.clone());
    table.register(EventType::CreateStudent, move |event: Event| {
        let (h, ctx) = (h.clone(), context(&event, &p));
        async move {
            let draft: StudentDraft = event.payload()?;
            Ok(committed(h.create_student(&ctx, draft).await?))
        }
    });

    let (h, p) = (handler.clone(), principal.clone());
    table.register(EventType::UpdateStudent, move |event: Event| {
        let (h, ctx) = (h.clone(), context(&event, &p));
        async move {
            let update: StudentUpdate = event.payload()?;
            Ok(committed(h.update_student(&ctx, update).await?))
        }
    });

    let (h, p) = (handler.clone(), principal.clone());
    table.register(EventType::DeleteStudent, move |event: Event| {
        let (h, ctx) = (h.clone(), context(&event, &p));
        async move {
            let key: StudentKey = event.payload()?;
            Ok(committed(h.delete_student(&ctx, key).await?))
        }
    });

    let (h, p) = (handler.clone(), principal.clone());
    table.register(EventType::CreateStudentHistory, move |event: Event| {
        let (h, ctx) = (h.clone(), context(&event, &p));
        async move {
            let request: StudentHistoryRequest = event.payload()?;
            Ok(committed(h.create_student_history(&ctx, request).await?))
        }
    });

    let h = handler;
    table.register(EventType::GetStudent, move |event: Event| {
        let h = h.clone();
        async move {
            let key: StudentKey = event.payload()?;
            let (outcome, student) = h.get_student(&key).await?;
            let payload = match student {
                Some(student) => serde_json::to_string(&student).map_err(StorageError::from)?,
                None => event.event_payload.clone(),
            };
            Ok(Reaction::Reply(Event::response(&event, outcome, payload)))
        }
    });

    table.register(EventType::OutboxProcessed, move |event: Event| {
        let reconciler = reconciler.clone();
        async move {
            let event_id = acknowledged_id(&event)?;
            reconciler.acknowledge(event_id).await?;
            Ok(Reaction::Done)
        }
    });

    table
}

/// How the dispatcher settled one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Handled,
    /// Unknown or unregistered event type.
    Ignored,
    /// Validation failed; a `VALIDATION_FAILED` reply was sent.
    Rejected,
    /// Malformed or permanently failing message, logged and dropped.
    Dropped,
}

struct DispatcherInner {
    table: DispatchTable,
    transport: Arc<dyn MessageTransport>,
    poller: Arc<OutboxPoller>,
    publish_on_commit: bool,
}

/// Routes inbound messages to registered handlers.
#[derive(Clone)]
pub struct InboundDispatcher {
    inner: Arc<DispatcherInner>,
}

impl InboundDispatcher {
    pub fn new(
        table: DispatchTable,
        transport: Arc<dyn MessageTransport>,
        poller: Arc<OutboxPoller>,
        publish_on_commit: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                table,
                transport,
                poller,
                publish_on_commit,
            }),
        }
    }

    /// Handle one message. `Err` means the message should be redelivered.
    pub async fn dispatch(&self, message: InboundMessage) -> crate::bus::Result<DispatchResult> {
        self.inner.dispatch(message).await
    }
}

impl DispatcherInner {
    #[tracing::instrument(name = "dispatch", skip_all, fields(subject = %message.subject))]
    async fn dispatch(&self, message: InboundMessage) -> crate::bus::Result<DispatchResult> {
        let mut event = match decode_event(&message.payload) {
            Ok(Decoded::Known(event)) => event,
            Ok(Decoded::Unsupported {
                event_type,
                saga_id,
            }) => {
                info!(event_type = %event_type, saga_id = ?saga_id, "Ignoring unsupported event type");
                return Ok(DispatchResult::Ignored);
            }
            Err(e) => {
                error!(error = %e, "Dropping malformed inbound message");
                return Ok(DispatchResult::Dropped);
            }
        };
        if event.reply_to.is_none() {
            event.reply_to = message.reply.clone();
        }

        let Some(handler) = self.table.get(event.event_type) else {
            info!(event_type = %event.event_type, saga_id = ?event.saga_id, "No handler registered, ignoring");
            return Ok(DispatchResult::Ignored);
        };

        match handler.handle(event.clone()).await {
            Ok(Reaction::Committed(record)) => {
                debug!(event_id = %record.event_id, event_type = %record.event_type, "Command committed");
                if self.publish_on_commit {
                    self.poller.publish_committed(&record).await;
                }
                Ok(DispatchResult::Handled)
            }
            Ok(Reaction::Reply(response)) => {
                self.reply(event.reply_to.as_deref(), &response).await?;
                Ok(DispatchResult::Handled)
            }
            Ok(Reaction::Done) => Ok(DispatchResult::Handled),
            Err(HandlerError::Validation(errors)) => {
                warn!(event_type = %event.event_type, saga_id = ?event.saga_id, ?errors, "Command failed validation");
                let payload = serde_json::json!(errors).to_string();
                let response = Event::response(&event, EventOutcome::ValidationFailed, payload);
                self.reply(event.reply_to.as_deref(), &response).await?;
                Ok(DispatchResult::Rejected)
            }
            Err(e) if e.is_transient() => {
                warn!(event_type = %event.event_type, saga_id = ?event.saga_id, error = %e, "Command failed, requesting redelivery");
                Err(BusError::Handler(e.to_string()))
            }
            Err(e) => {
                error!(event_type = %event.event_type, saga_id = ?event.saga_id, error = %e, "Dropping inbound message");
                Ok(DispatchResult::Dropped)
            }
        }
    }

    async fn reply(&self, reply_to: Option<&str>, response: &Event) -> crate::bus::Result<()> {
        let Some(reply_to) = reply_to else {
            debug!(event_type = %response.event_type, "No reply channel, response discarded");
            return Ok(());
        };
        let bytes = response
            .to_bytes()
            .map_err(|e| BusError::Publish(e.to_string()))?;
        self.transport.reply(reply_to, Bytes::from(bytes)).await
    }
}

impl MessageHandler for InboundDispatcher {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'static, crate::bus::Result<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.dispatch(message).await.map(|_| ()) })
    }
}

/// Subscribe the dispatcher to the command topic (queue group) and the
/// acknowledgment topic (durable consumer).
pub async fn subscribe_all(
    transport: &dyn MessageTransport,
    topics: &TopicsConfig,
    dispatcher: InboundDispatcher,
) -> crate::bus::Result<()> {
    let handler: Arc<dyn MessageHandler> = Arc::new(dispatcher);
    transport
        .subscribe(
            SubscriptionSpec::queue(&topics.command, &topics.command_group),
            handler.clone(),
        )
        .await?;
    transport
        .subscribe(
            SubscriptionSpec::durable(&topics.acks, &topics.acks_durable),
            handler,
        )
        .await?;
    info!(
        command = %topics.command,
        acks = %topics.acks,
        "Inbound subscriptions registered"
    );
    Ok(())
}
