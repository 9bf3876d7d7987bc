//! Reconnecting transport.
//!
//! A supervisor task owns the broker session. It connects with exponential
//! backoff (never giving up), re-creates every registered subscription on the
//! new session, and only then swaps it in. Publishers read the current
//! session under a lock and never see a half-built one.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    BrokerConnection, BusError, ConnectionState, Connector, Delivery, MessageHandler,
    MessageTransport, Result, SubscriptionSpec,
};
use crate::config::ReconnectConfig;
use crate::utils::retry::{next_delay, reconnect_backoff};

/// Runtime settings for [`ManagedTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Upper bound for one publish or reply.
    pub publish_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Inbound messages handled concurrently across all subscriptions.
    pub workers: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            workers: 16,
        }
    }
}

struct Subscription {
    spec: SubscriptionSpec,
    handler: Arc<dyn MessageHandler>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    settings: TransportSettings,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<Subscription>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

/// Transport that hides connection loss from publishers and subscribers.
pub struct ManagedTransport {
    shared: Arc<Shared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl ManagedTransport {
    /// Start the supervisor. Returns immediately; the first connection is
    /// established in the background.
    pub fn start(connector: Arc<dyn Connector>, settings: TransportSettings) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(settings.workers.max(1)));

        let shared = Arc::new(Shared {
            connector,
            settings,
            current: RwLock::new(None),
            state,
            subscriptions: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            workers,
            shutdown,
        });

        let supervisor = tokio::spawn(Shared::supervise(shared.clone()));

        Arc::new(Self {
            shared,
            supervisor: StdMutex::new(Some(supervisor)),
        })
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the transport reports `Connected`.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state_changes();
        let state = rx
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map_err(|_| BusError::Closed)?;
        match *state {
            ConnectionState::Connected => Ok(()),
            _ => Err(BusError::Closed),
        }
    }

    async fn current(&self) -> Result<Arc<dyn BrokerConnection>> {
        if *self.shared.shutdown.borrow() {
            return Err(BusError::Closed);
        }
        self.shared
            .current
            .read()
            .await
            .clone()
            .ok_or(BusError::NotConnected)
    }

    async fn bounded<F>(&self, op: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let timeout = self.shared.settings.publish_timeout;
        match tokio::time::timeout(timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl MessageTransport for ManagedTransport {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject = %subject))]
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let conn = self.current().await?;
        self.bounded(conn.publish(subject, payload)).await
    }

    #[tracing::instrument(name = "bus.reply", skip_all, fields(subject = %subject))]
    async fn reply(&self, subject: &str, payload: Bytes) -> Result<()> {
        let conn = self.current().await?;
        self.bounded(conn.reply(subject, payload)).await
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        // Held across registration so the supervisor cannot attach this
        // subscription a second time while we attach it to the live session.
        let mut subscriptions = self.shared.subscriptions.lock().await;
        let subscription = Subscription { spec, handler };

        let current = self.shared.current.read().await.clone();
        if let Some(conn) = current {
            let consumer = self.shared.start_consumer(&conn, &subscription).await?;
            self.shared.consumers.lock().await.push(consumer);
        }

        info!(
            subject = %subscription.spec.subject,
            group = %subscription.spec.group,
            durable = subscription.spec.durable,
            "Subscription registered"
        );
        subscriptions.push(subscription);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let supervisor = self
            .supervisor
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or(None);
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.shared.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for ManagedTransport {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let reconnect = self.settings.reconnect.clone();
        let mut backoff = reconnect_backoff(&reconnect).build();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);

            let established = match self.connector.connect().await {
                Ok(conn) => match self.attach(&conn).await {
                    Ok(()) => Ok(conn),
                    Err(e) => {
                        conn.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            let conn = match established {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = next_delay(&mut backoff, &reconnect);
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            info!(attempt, "Connected to broker");
            attempt = 0;
            backoff = reconnect_backoff(&reconnect).build();
            self.state.send_replace(ConnectionState::Connected);

            let stopping = tokio::select! {
                _ = conn.closed() => {
                    warn!("Broker connection lost, reconnecting");
                    false
                }
                _ = shutdown.changed() => true,
            };

            self.detach(&conn).await;
            if stopping {
                break;
            }
            self.state.send_replace(ConnectionState::Disconnected);
        }

        self.state.send_replace(ConnectionState::Closed);
        debug!("Transport supervisor stopped");
    }

    /// Subscribe everything registered so far, then publish the session.
    async fn attach(&self, conn: &Arc<dyn BrokerConnection>) -> Result<()> {
        let subscriptions = self.subscriptions.lock().await;
        let mut started = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions.iter() {
            match self.start_consumer(conn, subscription).await {
                Ok(handle) => started.push(handle),
                Err(e) => {
                    for handle in started {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        self.consumers.lock().await.extend(started);
        *self.current.write().await = Some(conn.clone());
        Ok(())
    }

    async fn detach(&self, conn: &Arc<dyn BrokerConnection>) {
        *self.current.write().await = None;
        for handle in self.consumers.lock().await.drain(..) {
            handle.abort();
        }
        conn.close().await;
    }

    async fn start_consumer(
        &self,
        conn: &Arc<dyn BrokerConnection>,
        subscription: &Subscription,
    ) -> Result<JoinHandle<()>> {
        let mut stream = conn.subscribe(&subscription.spec).await?;
        let handler = subscription.handler.clone();
        let workers = self.workers.clone();
        let subject = subscription.spec.subject.clone();

        Ok(tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                // Waiting for a permit stops pulling from the stream, so excess
                // deliveries stay queued at the broker.
                let permit = match workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process_delivery(handler, delivery).await;
                });
            }
            debug!(subject = %subject, "Subscription stream ended");
        }))
    }
}

async fn process_delivery(handler: Arc<dyn MessageHandler>, delivery: Delivery) {
    let Delivery { message, acker } = delivery;
    let subject = message.subject.clone();
    let result = handler.handle(message).await;

    match (result, acker) {
        (Ok(()), Some(acker)) => {
            if let Err(e) = acker.ack().await {
                warn!(subject = %subject, error = %e, "Failed to ack delivery");
            }
        }
        (Err(e), Some(acker)) => {
            warn!(subject = %subject, error = %e, "Handler failed, requesting redelivery");
            if let Err(e) = acker.nak().await {
                warn!(subject = %subject, error = %e, "Failed to nak delivery");
            }
        }
        (Err(e), None) => {
            warn!(subject = %subject, error = %e, "Handler failed");
        }
        (Ok(()), None) => {}
    }
}

#[cfg(test)]
mod tests;
