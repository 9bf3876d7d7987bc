//! Status reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{OutboxPoller, Result};
use crate::config::Config;
use crate::lock::{DistributedLock, LockError, LockLease};
use crate::model::EventStatus;
use crate::storage::{EventRecordStore, Result as StorageResult};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// How long a sent record may wait for its acknowledgment.
    pub grace: chrono::Duration,
    pub batch_size: usize,
    pub lock_name: String,
    pub lease: LockLease,
    pub owner: String,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, LockError> {
        Ok(Self {
            grace: config.reconciler.grace(),
            batch_size: config.reconciler.batch_size,
            lock_name: config.reconciler.lock_name.clone(),
            lease: LockLease::new(config.outbox.lock_at_most(), Duration::ZERO)?,
            owner: config.service.instance_id.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub acquired: bool,
    pub stale: usize,
    pub republished: usize,
    pub failed: usize,
}

/// Confirms delivery of sent records.
///
/// Acknowledgments mark records `MESSAGE_PUBLISHED`. Records sent but not
/// acknowledged within the grace period are republished through the
/// poller's publish path, which restarts their grace period.
pub struct StatusReconciler {
    store: Arc<dyn EventRecordStore>,
    lock: Arc<dyn DistributedLock>,
    poller: Arc<OutboxPoller>,
    settings: ReconcilerSettings,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        lock: Arc<dyn DistributedLock>,
        poller: Arc<OutboxPoller>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            lock,
            poller,
            settings,
        }
    }

    /// Apply an `OUTBOX_PROCESSED` acknowledgment.
    ///
    /// Returns `false` for an unknown or already purged record; that is not an error.
    pub async fn acknowledge(&self, event_id: Uuid) -> StorageResult<bool> {
        let found = self
            .store
            .update_status(event_id, EventStatus::MessagePublished)
            .await?;
        if found {
            debug!(event_id = %event_id, "Acknowledgment applied");
        } else {
            debug!(event_id = %event_id, "Acknowledgment for unknown record ignored");
        }
        Ok(found)
    }

    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let Some(guard) = self
            .lock
            .try_acquire(&self.settings.lock_name, &self.settings.owner, self.settings.lease)
            .await?
        else {
            debug!(lock = %self.settings.lock_name, "Reconciler lock held elsewhere, skipping");
            return Ok(ReconcileReport::default());
        };

        let result = self.republish_stale(now).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(lock = %self.settings.lock_name, error = %e, "Failed to release reconciler lock");
        }
        result
    }

    async fn republish_stale(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let cutoff = now - self.settings.grace;
        let stale = self
            .store
            .find_stale_unacked(cutoff, self.settings.batch_size)
            .await?;
        let mut report = ReconcileReport {
            acquired: true,
            stale: stale.len(),
            ..ReconcileReport::default()
        };

        for record in &stale {
            match self.poller.deliver(record).await {
                Ok(()) => report.republished += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(event_id = %record.event_id, error = %e, "Republish of unacknowledged record failed");
                }
            }
        }

        if report.stale > 0 {
            info!(
                stale = report.stale,
                republished = report.republished,
                failed = report.failed,
                "Republished unacknowledged records"
            );
        }
        Ok(report)
    }
}
