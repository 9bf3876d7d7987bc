//! Cluster-wide mutual exclusion for scheduled tasks.
//!
//! A lock is a named lease. Acquiring it succeeds only when no other owner
//! holds an unexpired lease. The holder may renew the lease while working and
//! releases it when done; release keeps the lease alive until the
//! `at_least` minimum has elapsed since acquisition, so that a fast tick on
//! one instance is not immediately repeated by another.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod sqlite;

pub use sqlite::SqliteLock;

/// Errors from lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid lease: {0}")]
    InvalidLease(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Lease bounds for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLease {
    /// The lease expires after this long even if the holder never releases it.
    pub at_most: Duration,
    /// Release does not free the lock before this long after acquisition.
    pub at_least: Duration,
}

impl LockLease {
    pub fn new(at_most: Duration, at_least: Duration) -> Result<Self> {
        if at_least > at_most {
            return Err(LockError::InvalidLease(format!(
                "at_least {:?} exceeds at_most {:?}",
                at_least, at_most
            )));
        }
        Ok(Self { at_most, at_least })
    }

    pub(crate) fn at_most_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.at_most).unwrap_or(chrono::Duration::MAX)
    }

    pub(crate) fn at_least_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.at_least).unwrap_or(chrono::Duration::MAX)
    }
}

/// Proof of a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub name: String,
    pub owner: String,
    pub lease: LockLease,
    pub locked_at: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,
}

impl LockGuard {
    /// Whether more than half of the current lease has elapsed.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        let remaining = self.lock_until - now;
        remaining < self.lease.at_most_chrono() / 2
    }
}

/// Named lease lock shared by all service instances.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock if it is free or its lease has expired.
    ///
    /// Returns `None` when another owner holds an unexpired lease.
    async fn try_acquire(&self, name: &str, owner: &str, lease: LockLease)
        -> Result<Option<LockGuard>>;

    /// Extend the lease by `at_most` from now.
    ///
    /// Returns `false` if the lease was lost (expired and taken by another owner).
    async fn renew(&self, guard: &mut LockGuard) -> Result<bool>;

    /// Give the lock up, honouring the `at_least` minimum hold time.
    async fn release(&self, guard: LockGuard) -> Result<()>;
}
