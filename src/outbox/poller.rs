//! Outbox poller.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::Result;
use crate::bus::MessageTransport;
use crate::config::{AckMode, Config};
use crate::lock::{DistributedLock, LockError, LockGuard, LockLease};
use crate::model::{ChoreographedEvent, Event, EventRecord, EventStatus};
use crate::storage::EventRecordStore;

/// Poller settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Fan-out subject for choreography subscribers.
    pub events_topic: String,
    pub batch_size: usize,
    pub lock_name: String,
    pub lease: LockLease,
    /// Lock owner; unique per service instance.
    pub owner: String,
    pub ack_mode: AckMode,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, LockError> {
        Ok(Self {
            events_topic: config.messaging.topics.events.clone(),
            batch_size: config.outbox.batch_size,
            lock_name: config.outbox.lock_name.clone(),
            lease: LockLease::new(config.outbox.lock_at_most(), config.outbox.lock_at_least())?,
            owner: config.service.instance_id.clone(),
            ack_mode: config.outbox.ack_mode,
        })
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// False when another instance held the lock and nothing was scanned.
    pub acquired: bool,
    pub scanned: usize,
    pub published: usize,
    pub failed: usize,
}

/// Publishes pending outbox records.
///
/// Each tick takes the cluster lock, scans a batch of pending records oldest
/// first and publishes them one by one. A record whose publish fails stays
/// pending for the next tick; the rest of the batch carries on.
pub struct OutboxPoller {
    store: Arc<dyn EventRecordStore>,
    lock: Arc<dyn DistributedLock>,
    transport: Arc<dyn MessageTransport>,
    settings: PollerSettings,
}

impl OutboxPoller {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        lock: Arc<dyn DistributedLock>,
        transport: Arc<dyn MessageTransport>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            lock,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let Some(mut guard) = self
            .lock
            .try_acquire(&self.settings.lock_name, &self.settings.owner, self.settings.lease)
            .await?
        else {
            debug!(lock = %self.settings.lock_name, "Outbox lock held elsewhere, skipping tick");
            return Ok(TickReport::default());
        };

        let result = self.drain(&mut guard).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(lock = %self.settings.lock_name, error = %e, "Failed to release outbox lock");
        }
        result
    }

    async fn drain(&self, guard: &mut LockGuard) -> Result<TickReport> {
        let records = self.store.find_pending(self.settings.batch_size).await?;
        let mut report = TickReport {
            acquired: true,
            scanned: records.len(),
            ..TickReport::default()
        };

        for record in &records {
            if guard.needs_renewal(Utc::now()) && !self.lock.renew(guard).await? {
                warn!(lock = %guard.name, "Outbox lock lost mid-batch, ending tick");
                break;
            }

            match self.deliver(record).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        event_id = %record.event_id,
                        event_type = %record.event_type,
                        error = %e,
                        "Outbox publish failed, record stays pending"
                    );
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                published = report.published,
                failed = report.failed,
                "Outbox tick complete"
            );
        }
        Ok(report)
    }

    /// Publish one record: direct reply first when a reply channel is set,
    /// then the fan-out copy. Advances the record per the ack mode.
    pub async fn deliver(&self, record: &EventRecord) -> Result<()> {
        if let Some(reply_channel) = &record.reply_channel {
            let reply = Event::from_record(record).to_bytes()?;
            self.transport
                .reply(reply_channel, Bytes::from(reply))
                .await?;
        }

        let fan_out = ChoreographedEvent::from_record(record).to_bytes()?;
        self.transport
            .publish(&self.settings.events_topic, Bytes::from(fan_out))
            .await?;

        match self.settings.ack_mode {
            AckMode::Immediate => {
                self.store
                    .update_status(record.event_id, EventStatus::MessagePublished)
                    .await?;
            }
            AckMode::Deferred => {
                self.store.mark_sent(record.event_id, Utc::now()).await?;
            }
        }

        debug!(event_id = %record.event_id, saga_id = ?record.saga_id, "Outbox record published");
        Ok(())
    }

    /// Publish a just-committed record without waiting for the next tick.
    ///
    /// Runs outside the lock; a concurrent tick may publish the same record
    /// too. Failures are left to the scheduled tick.
    pub async fn publish_committed(&self, record: &EventRecord) {
        if let Err(e) = self.deliver(record).await {
            debug!(
                event_id = %record.event_id,
                error = %e,
                "Publish on commit failed, leaving record for the poller"
            );
        }
    }
}
