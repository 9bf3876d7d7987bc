//! Retention purge.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::Result;
use crate::config::Config;
use crate::lock::{DistributedLock, LockError, LockLease};
use crate::storage::EventRecordStore;

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub retention: chrono::Duration,
    pub lock_name: String,
    pub lease: LockLease,
    pub owner: String,
}

impl PurgeSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, LockError> {
        Ok(Self {
            retention: config.purge.retention(),
            lock_name: config.purge.lock_name.clone(),
            lease: LockLease::new(config.outbox.lock_at_most(), Duration::ZERO)?,
            owner: config.service.instance_id.clone(),
        })
    }
}

/// Deletes outbox records older than the retention horizon, whatever their status.
///
/// Runs on its own pooled connection, never inside a business transaction.
pub struct RetentionPurge {
    store: Arc<dyn EventRecordStore>,
    lock: Arc<dyn DistributedLock>,
    settings: PurgeSettings,
}

impl RetentionPurge {
    pub fn new(
        store: Arc<dyn EventRecordStore>,
        lock: Arc<dyn DistributedLock>,
        settings: PurgeSettings,
    ) -> Self {
        Self {
            store,
            lock,
            settings,
        }
    }

    /// Returns the number of deleted records, or `None` when another
    /// instance held the lock.
    pub async fn purge_once(&self, now: DateTime<Utc>) -> Result<Option<u64>> {
        let Some(guard) = self
            .lock
            .try_acquire(&self.settings.lock_name, &self.settings.owner, self.settings.lease)
            .await?
        else {
            debug!(lock = %self.settings.lock_name, "Purge lock held elsewhere, skipping");
            return Ok(None);
        };

        let cutoff = now - self.settings.retention;
        let result = self.store.purge_older_than(cutoff).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(lock = %self.settings.lock_name, error = %e, "Failed to release purge lock");
        }

        let deleted = result?;
        info!(deleted, cutoff = %cutoff, "Purged expired outbox records");
        Ok(Some(deleted))
    }
}
