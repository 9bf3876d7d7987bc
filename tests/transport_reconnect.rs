//! Managed transport behaviour against a failing broker.
//!
//! Run with: cargo test --test transport_reconnect --features channel

mod common;

use std::time::Duration;

use uuid::Uuid;

use common::*;
use student_outbox::bus::{BusError, MessageTransport};
use student_outbox::config::AckMode;
use student_outbox::handlers::CommandContext;
use student_outbox::model::{ChoreographedEvent, EventStatus, EventType};

#[tokio::test]
async fn test_poller_resumes_after_broker_outage() {
    let service = start_service(AckMode::Immediate).await;
    let outcome = service
        .handler
        .create_student(&CommandContext::new("student-api"), draft("120164447", "Wayne"))
        .await
        .unwrap();
    let event_id = outcome.record.event_id;
    let attempts_before = service.broker.connect_attempts().len();

    service.broker.fail_next_connects(3);
    service.broker.drop_connections();

    let report = service.poller.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(service.status(event_id).await, EventStatus::DbCommitted);

    service.wait_reconnected().await;
    assert!(service.broker.connect_attempts().len() >= attempts_before + 4);

    let report = service.poller.tick().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(service.status(event_id).await, EventStatus::MessagePublished);

    service.shutdown().await;
}

#[tokio::test]
async fn test_publish_fails_fast_while_disconnected() {
    let service = start_service(AckMode::Immediate).await;
    service.broker.fail_next_connects(usize::MAX);
    service.broker.drop_connections();

    let s = &service;
    eventually(move || async move {
        matches!(
            s.transport.publish(EVENTS_TOPIC, "{}".into()).await,
            Err(BusError::NotConnected)
        )
    })
    .await;

    service.shutdown().await;
}

#[tokio::test]
async fn test_stalled_publish_times_out() {
    let service = start_service(AckMode::Immediate).await;
    let outcome = service
        .handler
        .create_student(&CommandContext::new("student-api"), draft("120164447", "Wayne"))
        .await
        .unwrap();
    service
        .broker
        .set_publish_delay(Some(Duration::from_secs(5)));

    let started = tokio::time::Instant::now();
    let report = service.poller.tick().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        service.status(outcome.record.event_id).await,
        EventStatus::DbCommitted
    );

    service.broker.clear_failures();
    let report = service.poller.tick().await.unwrap();
    assert_eq!(report.published, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_command_subscription_restored_after_reconnect() {
    let service = start_service(AckMode::Immediate).await;
    service.broker.fail_next_connects(2);
    service.broker.drop_connections();
    service.wait_reconnected().await;

    let saga_id = Uuid::new_v4();
    service.broker.send(
        COMMAND_TOPIC,
        Some("_INBOX.after"),
        command(EventType::CreateStudent, Some(saga_id), &draft("120164447", "Wayne")),
    );

    let s = &service;
    eventually(move || async move {
        s.record_for(saga_id, EventType::CreateStudent).await.is_some()
    })
    .await;

    service.shutdown().await;
}

#[tokio::test]
async fn test_acknowledgments_sent_during_outage_are_not_lost() {
    let service = start_service(AckMode::Deferred).await;
    let outcome = service
        .handler
        .create_student(&CommandContext::new("student-api"), draft("120164447", "Wayne"))
        .await
        .unwrap();
    let event_id = outcome.record.event_id;
    service.poller.tick().await.unwrap();
    let ack = ChoreographedEvent::from_record(&service.record(event_id).await).acknowledgment();

    service.broker.fail_next_connects(2);
    service.broker.drop_connections();
    // The durable ack consumer has no members right now; the broker keeps the
    // message until the consumer is re-created.
    service
        .broker
        .send(ACKS_TOPIC, None, ack.to_bytes().unwrap());

    service.wait_reconnected().await;
    let s = &service;
    eventually(move || async move { s.status(event_id).await == EventStatus::MessagePublished })
        .await;

    service.shutdown().await;
}
