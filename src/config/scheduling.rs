//! Configuration for the periodic tasks, reconnect policy and inbound workers.

use std::time::Duration;

use serde::Deserialize;

/// How a successful publish advances an outbox record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The broker's publish-ack marks the record published on the same tick.
    #[default]
    Immediate,
    /// The record stays pending, stamped as sent, until an `OUTBOX_PROCESSED`
    /// acknowledgment arrives.
    Deferred,
}

/// Broker reconnect backoff.
///
/// Retries never stop; the delay grows from `min_delay_ms` by `factor` and is
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 60_000,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Outbox poller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    /// Maximum records published per tick.
    pub batch_size: usize,
    /// Cluster-wide lock guarding the poller.
    pub lock_name: String,
    /// Lease length; a crashed holder blocks others for at most this long.
    pub lock_at_most_ms: u64,
    /// Minimum hold time, so fast ticks on different instances do not interleave.
    pub lock_at_least_ms: u64,
    pub ack_mode: AckMode,
    /// Publish a freshly committed record straight away, ahead of the next tick.
    pub publish_on_commit: bool,
    /// Upper bound for a single broker publish.
    pub publish_timeout_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            lock_name: "student-outbox-poller".to_string(),
            lock_at_most_ms: 60_000,
            lock_at_least_ms: 500,
            ack_mode: AckMode::Immediate,
            publish_on_commit: true,
            publish_timeout_ms: 5_000,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_at_most(&self) -> Duration {
        Duration::from_millis(self.lock_at_most_ms)
    }

    pub fn lock_at_least(&self) -> Duration {
        Duration::from_millis(self.lock_at_least_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Status reconciler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// How long a sent record may wait for its acknowledgment before it is republished.
    pub grace_secs: u64,
    pub batch_size: usize,
    pub lock_name: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            grace_secs: 600,
            batch_size: 100,
            lock_name: "student-outbox-reconciler".to_string(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }
}

/// Retention purge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Records older than this many days are deleted regardless of status.
    pub retention_days: u32,
    pub lock_name: String,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 3600,
            retention_days: 7,
            lock_name: "student-outbox-purge".to_string(),
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }
}

/// Inbound dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent inbound message handlers; excess deliveries wait.
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { workers: 16 }
    }
}

/// Service identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Lock owner name for this instance.
    pub instance_id: String,
    /// Principal written to audit columns by inbound commands.
    pub principal: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("student-outbox-{}", uuid::Uuid::new_v4()),
            principal: "student-api".to_string(),
        }
    }
}
