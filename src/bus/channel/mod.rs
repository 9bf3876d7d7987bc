//! In-memory broker.
//!
//! Routes messages between connections in the same process with the same
//! consumer-group semantics as the NATS adapter: each group on a subject gets
//! one copy, delivered round-robin to its members; durable groups keep a
//! backlog while they have no members and redeliver on nak. A durable
//! delivery stays owed until it is acked: when its member goes away it
//! returns to the group and is delivered again.
//!
//! The broker records everything the service sends and can be told to refuse
//! connections, fail or delay publishes, and drop every live connection.
//! Standalone deployments use it as the bus; tests use it to exercise failure
//! handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    Acker, BrokerConnection, BusError, Connector, Delivery, DeliveryStream, InboundMessage, Result,
    SubscriptionSpec,
};

/// How a recorded message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Publish,
    Reply,
}

/// A message the service handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub kind: SentKind,
    pub subject: String,
    pub payload: Bytes,
}

impl SentMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

type GroupKey = (String, String);

#[derive(Default)]
struct Group {
    durable: bool,
    members: Vec<(u64, mpsc::UnboundedSender<Delivery>)>,
    next: usize,
    backlog: VecDeque<InboundMessage>,
    next_delivery: u64,
    /// Durable deliveries handed to a member and not yet settled, by delivery id.
    unacked: BTreeMap<u64, (u64, InboundMessage)>,
}

impl Group {
    /// Hand `message` to the next live member, or keep it if the group is durable.
    fn offer(&mut self, broker: &ChannelBroker, key: &GroupKey, message: InboundMessage) {
        let mut queue = VecDeque::from([message]);
        'messages: while let Some(message) = queue.pop_front() {
            while !self.members.is_empty() {
                let index = self.next % self.members.len();
                self.next = self.next.wrapping_add(1);
                let member = self.members[index].0;
                let (id, delivery) = self.delivery(broker, key, member, message.clone());
                if self.members[index].1.send(delivery).is_ok() {
                    continue 'messages;
                }
                if let Some(id) = id {
                    self.unacked.remove(&id);
                }
                self.members.remove(index);
                queue.extend(self.release(member));
            }
            if self.durable {
                self.backlog.push_back(message);
            }
        }
    }

    fn delivery(
        &mut self,
        broker: &ChannelBroker,
        key: &GroupKey,
        member: u64,
        message: InboundMessage,
    ) -> (Option<u64>, Delivery) {
        if !self.durable {
            return (None, Delivery::new(message));
        }
        self.next_delivery += 1;
        let id = self.next_delivery;
        self.unacked.insert(id, (member, message.clone()));
        let delivery = Delivery::new(message).with_acker(Box::new(ChannelAcker {
            broker: broker.clone(),
            key: key.clone(),
            delivery: id,
        }));
        (Some(id), delivery)
    }

    /// Take back every unsettled delivery owned by `member`, oldest first.
    fn release(&mut self, member: u64) -> Vec<InboundMessage> {
        let ids: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == member)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.unacked.remove(&id))
            .map(|(_, message)| message)
            .collect()
    }

    fn remove_member(&mut self, broker: &ChannelBroker, key: &GroupKey, member: u64) {
        self.members.retain(|(id, _)| *id != member);
        let orphaned = self.release(member);
        if self.members.is_empty() {
            self.requeue_front(orphaned);
        } else {
            for message in orphaned {
                self.offer(broker, key, message);
            }
        }
    }

    fn clear_members(&mut self) {
        self.members.clear();
        let orphaned: Vec<InboundMessage> = std::mem::take(&mut self.unacked)
            .into_values()
            .map(|(_, message)| message)
            .collect();
        self.requeue_front(orphaned);
    }

    /// Put unsettled messages ahead of anything that arrived after them.
    fn requeue_front(&mut self, messages: Vec<InboundMessage>) {
        if !self.durable {
            return;
        }
        for message in messages.into_iter().rev() {
            self.backlog.push_front(message);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    connections: HashMap<u64, watch::Sender<bool>>,
    groups: HashMap<GroupKey, Group>,
    sent: Vec<SentMessage>,
    connect_attempts: Vec<Instant>,
    fail_connects: usize,
    fail_publishes: usize,
    fail_containing: Vec<String>,
    publish_delay: Option<Duration>,
    acked: usize,
    nacked: usize,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> ChannelConnector {
        ChannelConnector::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    /// Fail the next `n` publishes or replies.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().fail_publishes = n;
    }

    /// Fail every publish whose payload contains `needle` until cleared.
    pub fn fail_publishes_containing(&self, needle: impl Into<String>) {
        self.lock().fail_containing.push(needle.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_connects = 0;
        state.fail_publishes = 0;
        state.fail_containing.clear();
        state.publish_delay = None;
    }

    /// Hold every publish for `delay` before accepting it.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.lock().publish_delay = delay;
    }

    /// Sever every live connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for (id, closed) in state.connections.drain() {
            debug!(connection = id, "Dropping channel connection");
            closed.send_replace(true);
        }
        for group in state.groups.values_mut() {
            group.clear_members();
        }
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Times at which connections were attempted, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn sent_to(&self, subject: &str) -> Vec<SentMessage> {
        self.lock()
            .sent
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked
    }

    pub fn nacked_count(&self) -> usize {
        self.lock().nacked
    }

    /// Deliver a message from an outside client (not recorded as sent).
    pub fn send(&self, subject: &str, reply: Option<&str>, payload: impl Into<Bytes>) {
        let message = InboundMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload: payload.into(),
        };
        let mut state = self.lock();
        state.route(self, message);
    }

    fn accept(&self, kind: SentKind, subject: &str, payload: Bytes) -> Result<()> {
        let mut state = self.lock();

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BusError::Publish("injected publish failure".to_string()));
        }
        let text = String::from_utf8_lossy(&payload);
        if state.fail_containing.iter().any(|needle| text.contains(needle.as_str())) {
            return Err(BusError::Publish("injected publish failure".to_string()));
        }

        state.sent.push(SentMessage {
            kind,
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        if kind == SentKind::Publish {
            state.route(
                self,
                InboundMessage {
                    subject: subject.to_string(),
                    reply: None,
                    payload,
                },
            );
        }
        Ok(())
    }
}

impl BrokerState {
    fn route(&mut self, broker: &ChannelBroker, message: InboundMessage) {
        let keys: Vec<GroupKey> = self
            .groups
            .keys()
            .filter(|(subject, _)| *subject == message.subject)
            .cloned()
            .collect();
        for key in keys {
            self.deliver_to(broker, &key, message.clone());
        }
    }

    fn deliver_to(&mut self, broker: &ChannelBroker, key: &GroupKey, message: InboundMessage) {
        if let Some(group) = self.groups.get_mut(key) {
            group.offer(broker, key, message);
        }
    }
}

struct ChannelAcker {
    broker: ChannelBroker,
    key: GroupKey,
    delivery: u64,
}

impl ChannelAcker {
    /// Settle the delivery. `None` if it was already settled or handed back
    /// to the group when its member went away.
    fn settle(&self, state: &mut BrokerState) -> Option<InboundMessage> {
        state
            .groups
            .get_mut(&self.key)?
            .unacked
            .remove(&self.delivery)
            .map(|(_, message)| message)
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.acked += 1;
        self.settle(&mut state);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.nacked += 1;
        if let Some(message) = self.settle(&mut state) {
            state.deliver_to(&self.broker, &self.key, message);
        }
        Ok(())
    }
}

/// Connector handing out sessions on a [`ChannelBroker`].
#[derive(Clone)]
pub struct ChannelConnector {
    broker: ChannelBroker,
}

impl ChannelConnector {
    pub fn new(broker: ChannelBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.broker.lock();
        state.connect_attempts.push(Instant::now());

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BusError::Connection("channel broker unavailable".to_string()));
        }

        let id = state.next_connection;
        state.next_connection += 1;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.connections.insert(id, closed_tx);

        Ok(Arc::new(ChannelConnection {
            id,
            broker: self.broker.clone(),
            closed: closed_rx,
        }))
    }
}

struct ChannelConnection {
    id: u64,
    broker: ChannelBroker,
    closed: watch::Receiver<bool>,
}

impl ChannelConnection {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(BusError::NotConnected);
        }
        Ok(())
    }

    async fn send(&self, kind: SentKind, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let delay = self.broker.lock().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_open()?;
        }
        self.broker.accept(kind, subject, payload)
    }
}

#[async_trait]
impl BrokerConnection for ChannelConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.send(SentKind::Publish, subject, payload).await
    }

    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.send(SentKind::Reply, subject, payload).await
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (spec.subject.clone(), spec.group.clone());

        let mut state = self.broker.lock();
        let group = state.groups.entry(key.clone()).or_default();
        group.durable = spec.durable;
        group.members.push((self.id, tx));

        let backlog: Vec<InboundMessage> = group.backlog.drain(..).collect();
        for message in backlog {
            group.offer(&self.broker, &key, message);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        let mut state = self.broker.lock();
        if let Some(closed) = state.connections.remove(&self.id) {
            closed.send_replace(true);
        }
        for (key, group) in state.groups.iter_mut() {
            group.remove_member(&self.broker, key, self.id);
        }
    }
}
