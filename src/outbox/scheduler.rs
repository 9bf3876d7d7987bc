//! Periodic background tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{OutboxPoller, Result, RetentionPurge, StatusReconciler};

/// One unit of scheduled work.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<()>;
}

#[async_trait]
impl PeriodicTask for OutboxPoller {
    fn name(&self) -> &'static str {
        "outbox-poller"
    }

    async fn run_once(&self) -> Result<()> {
        self.tick().await.map(|_| ())
    }
}

#[async_trait]
impl PeriodicTask for StatusReconciler {
    fn name(&self) -> &'static str {
        "status-reconciler"
    }

    async fn run_once(&self) -> Result<()> {
        self.reconcile_once(Utc::now()).await.map(|_| ())
    }
}

#[async_trait]
impl PeriodicTask for RetentionPurge {
    fn name(&self) -> &'static str {
        "retention-purge"
    }

    async fn run_once(&self) -> Result<()> {
        self.purge_once(Utc::now()).await.map(|_| ())
    }
}

/// Handle to a running periodic task.
pub struct TaskHandle {
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop. A run in progress completes first.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}

/// Run `task` every `interval` until stopped. A failed run is logged and
/// the schedule continues.
pub fn spawn_periodic<T: PeriodicTask>(task: Arc<T>, interval: Duration) -> TaskHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let name = task.name();

    let handle = tokio::spawn(async move {
        info!(
            task = name,
            interval_ms = interval.as_millis() as u64,
            "Periodic task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = task.run_once().await {
                        error!(task = name, error = %e, "Periodic task run failed");
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!(task = name, "Periodic task stopped");
                        break;
                    }
                }
            }
        }
    });

    TaskHandle {
        name,
        cancel: cancel_tx,
        handle,
    }
}
