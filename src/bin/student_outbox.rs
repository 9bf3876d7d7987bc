//! student-outbox: student command service with outbox delivery
//!
//! Consumes commands from the command topic, commits each mutation together
//! with its outbox record, and publishes pending records to the events topic.
//!
//! ## Configuration
//! ```yaml
//! storage:
//!   path: /var/lib/student-outbox/outbox.db
//!
//! messaging:
//!   type: nats
//!   nats:
//!     url: nats://localhost:4222
//!   topics:
//!     command: STUDENT_API_TOPIC
//!     events: STUDENT_EVENTS_TOPIC
//!     acks: STUDENT_EVENTS_ACK_TOPIC
//!
//! outbox:
//!   poll_interval_ms: 1000
//!   ack_mode: deferred
//! ```

use std::sync::Arc;

use tracing::{error, info};

use student_outbox::bus::{init_connector, ManagedTransport, MessageTransport, TransportSettings};
use student_outbox::config::Config;
use student_outbox::dispatch::{student_table, subscribe_all, InboundDispatcher};
use student_outbox::handlers::StudentCommandHandler;
use student_outbox::lock::SqliteLock;
use student_outbox::outbox::{
    spawn_periodic, OutboxPoller, PollerSettings, PurgeSettings, ReconcilerSettings,
    RetentionPurge, StatusReconciler,
};
use student_outbox::storage::{init_storage, SqliteEventRecordStore};
use student_outbox::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.service.instance_id,
        messaging_type = ?config.messaging.messaging_type,
        ack_mode = ?config.outbox.ack_mode,
        "Starting student-outbox"
    );

    let pool = init_storage(&config.storage).await?;
    let store = Arc::new(
        SqliteEventRecordStore::new(pool.clone()).with_principal(config.service.principal.clone()),
    );
    let lock = Arc::new(SqliteLock::new(pool.clone()));

    let connector = init_connector(&config)?;
    let transport = ManagedTransport::start(
        connector,
        TransportSettings {
            publish_timeout: config.outbox.publish_timeout(),
            reconnect: config.reconnect.clone(),
            workers: config.dispatcher.workers,
        },
    );

    let poller = Arc::new(OutboxPoller::new(
        store.clone(),
        lock.clone(),
        transport.clone(),
        PollerSettings::from_config(&config)?,
    ));
    let reconciler = Arc::new(StatusReconciler::new(
        store.clone(),
        lock.clone(),
        poller.clone(),
        ReconcilerSettings::from_config(&config)?,
    ));

    let handler = StudentCommandHandler::new(pool.clone());
    let table = student_table(handler, reconciler.clone(), config.service.principal.clone());
    let dispatcher = InboundDispatcher::new(
        table,
        transport.clone(),
        poller.clone(),
        config.outbox.publish_on_commit,
    );
    subscribe_all(transport.as_ref(), &config.messaging.topics, dispatcher).await?;

    let mut tasks = vec![spawn_periodic(poller, config.outbox.poll_interval())];
    if config.reconciler.enabled {
        tasks.push(spawn_periodic(reconciler, config.reconciler.interval()));
    }
    if config.purge.enabled {
        let purge = Arc::new(RetentionPurge::new(
            store,
            lock,
            PurgeSettings::from_config(&config)?,
        ));
        tasks.push(spawn_periodic(purge, config.purge.interval()));
    }

    info!(tasks = tasks.len(), "student-outbox running");

    shutdown_signal().await;

    for task in tasks {
        info!(task = task.name(), "Stopping periodic task");
        task.shutdown().await;
    }
    transport.close().await;
    pool.close().await;

    info!("student-outbox stopped");
    Ok(())
}
