//! Outbox delivery.
//!
//! - `OutboxPoller`: publishes pending records under the cluster lock
//! - `StatusReconciler`: republishes sent-but-unacknowledged records and
//!   applies `OUTBOX_PROCESSED` acknowledgments
//! - `RetentionPurge`: deletes records past the retention horizon
//! - `spawn_periodic`: runs any of the above on an interval until stopped
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   poll_interval_ms: 1000
//!   batch_size: 100
//!   ack_mode: immediate      # or deferred
//!   publish_on_commit: true
//! reconciler:
//!   interval_secs: 300
//!   grace_secs: 600
//! purge:
//!   retention_days: 7
//! ```

use crate::bus::BusError;
use crate::lock::LockError;
use crate::storage::StorageError;

mod poller;
mod purge;
mod reconciler;
mod scheduler;

pub use poller::{OutboxPoller, PollerSettings, TickReport};
pub use purge::{PurgeSettings, RetentionPurge};
pub use reconciler::{ReconcileReport, ReconcilerSettings, StatusReconciler};
pub use scheduler::{spawn_periodic, PeriodicTask, TaskHandle};

/// Errors from outbox delivery.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Transport error: {0}")]
    Bus(#[from] BusError),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutboxError>;
