//! Shared utilities for integration tests.
//!
//! Starts the service components against a file-backed SQLite database in a
//! temp dir and the in-memory channel broker.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use student_outbox::bus::{
    ChannelBroker, ConnectionState, ManagedTransport, MessageTransport, TransportSettings,
};
use student_outbox::config::{AckMode, Config};
use student_outbox::dispatch::{student_table, subscribe_all, InboundDispatcher};
use student_outbox::handlers::StudentCommandHandler;
use student_outbox::lock::SqliteLock;
use student_outbox::model::{
    Event, EventOutcome, EventRecord, EventStatus, EventType, StudentDraft,
};
use student_outbox::outbox::{
    OutboxPoller, PollerSettings, PurgeSettings, ReconcilerSettings, RetentionPurge,
    StatusReconciler,
};
use student_outbox::storage::{
    init_storage, EventRecordStore, SqliteEventRecordStore, WriteTransaction,
};

pub const COMMAND_TOPIC: &str = "STUDENT_API_TOPIC";
pub const EVENTS_TOPIC: &str = "STUDENT_EVENTS_TOPIC";
pub const ACKS_TOPIC: &str = "STUDENT_EVENTS_ACK_TOPIC";

/// Config tuned for tests: short backoff, no lock hold-over, fast timeouts.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::for_test();
    config.storage.path = dir.path().join("outbox.db").to_string_lossy().into_owned();
    config.reconnect.min_delay_ms = 20;
    config.reconnect.max_delay_ms = 200;
    config.outbox.lock_at_least_ms = 0;
    config.outbox.publish_timeout_ms = 300;
    config.outbox.publish_on_commit = false;
    config.service.instance_id = "instance-a".to_string();
    config.service.principal = "student-api".to_string();
    config.dispatcher.workers = 4;
    config
}

/// One running service instance.
pub struct Service {
    pub dir: TempDir,
    pub config: Config,
    pub pool: SqlitePool,
    pub broker: ChannelBroker,
    pub transport: Arc<ManagedTransport>,
    pub store: Arc<SqliteEventRecordStore>,
    pub lock: Arc<SqliteLock>,
    pub handler: StudentCommandHandler,
    pub poller: Arc<OutboxPoller>,
    pub reconciler: Arc<StatusReconciler>,
    pub purge: RetentionPurge,
}

pub async fn start_service(ack_mode: AckMode) -> Service {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = test_config(&dir);
    config.outbox.ack_mode = ack_mode;
    start_service_with(dir, config).await
}

pub async fn start_service_with(dir: TempDir, config: Config) -> Service {
    let pool = init_storage(&config.storage).await.expect("storage");
    let broker = ChannelBroker::new();
    let transport = ManagedTransport::start(
        Arc::new(broker.connector()),
        TransportSettings {
            publish_timeout: config.outbox.publish_timeout(),
            reconnect: config.reconnect.clone(),
            workers: config.dispatcher.workers,
        },
    );
    transport.wait_connected().await.expect("connected");

    let store = Arc::new(
        SqliteEventRecordStore::new(pool.clone()).with_principal(config.service.principal.clone()),
    );
    let lock = Arc::new(SqliteLock::new(pool.clone()));
    let poller = Arc::new(OutboxPoller::new(
        store.clone(),
        lock.clone(),
        transport.clone(),
        PollerSettings::from_config(&config).expect("poller settings"),
    ));
    let reconciler = Arc::new(StatusReconciler::new(
        store.clone(),
        lock.clone(),
        poller.clone(),
        ReconcilerSettings::from_config(&config).expect("reconciler settings"),
    ));
    let purge = RetentionPurge::new(
        store.clone(),
        lock.clone(),
        PurgeSettings::from_config(&config).expect("purge settings"),
    );

    let handler = StudentCommandHandler::new(pool.clone());
    let dispatcher = InboundDispatcher::new(
        student_table(
            handler.clone(),
            reconciler.clone(),
            config.service.principal.clone(),
        ),
        transport.clone(),
        poller.clone(),
        config.outbox.publish_on_commit,
    );
    subscribe_all(transport.as_ref(), &config.messaging.topics, dispatcher)
        .await
        .expect("subscribe");

    Service {
        dir,
        config,
        pool,
        broker,
        transport,
        store,
        lock,
        handler,
        poller,
        reconciler,
        purge,
    }
}

impl Service {
    pub async fn record(&self, event_id: Uuid) -> EventRecord {
        self.store
            .find_by_id(event_id)
            .await
            .expect("lookup")
            .expect("record exists")
    }

    pub async fn status(&self, event_id: Uuid) -> EventStatus {
        self.record(event_id).await.event_status
    }

    pub async fn record_for(&self, saga_id: Uuid, event_type: EventType) -> Option<EventRecord> {
        self.store
            .find_by_saga_and_type(saga_id, event_type)
            .await
            .expect("lookup")
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .expect("count")
    }

    /// Write an outbox record directly, as a handler transaction would.
    pub async fn insert_record(&self, record: &EventRecord) {
        let mut tx = WriteTransaction::begin(&self.pool).await.expect("begin");
        SqliteEventRecordStore::insert(tx.conn().expect("conn"), record)
            .await
            .expect("insert");
        tx.commit().await.expect("commit");
    }

    /// Wait until the transport has a fresh session after a broker drop.
    pub async fn wait_reconnected(&self) {
        let service = self;
        eventually(move || async move {
            service.transport.state() == ConnectionState::Connected
                && service.broker.live_connections() == 1
        })
        .await;
    }

    pub async fn shutdown(self) {
        self.transport.close().await;
        self.pool.close().await;
    }
}

pub fn draft(pen: &str, last_name: &str) -> StudentDraft {
    StudentDraft {
        pen: pen.to_string(),
        legal_first_name: Some("Bruce".to_string()),
        legal_last_name: last_name.to_string(),
        ..StudentDraft::default()
    }
}

/// Serialized command envelope.
pub fn command(event_type: EventType, saga_id: Option<Uuid>, body: &impl serde::Serialize) -> Vec<u8> {
    Event::new(
        event_type,
        saga_id,
        serde_json::to_string(body).expect("encode body"),
    )
    .to_bytes()
    .expect("encode envelope")
}

pub fn pending_record(at: DateTime<Utc>) -> EventRecord {
    EventRecord::new(
        Uuid::new_v4(),
        Some(Uuid::new_v4()),
        EventType::UpdateStudent,
        EventOutcome::StudentUpdated,
        format!("{{\"studentId\":\"{}\"}}", Uuid::new_v4()),
        "student-api",
        at,
    )
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
