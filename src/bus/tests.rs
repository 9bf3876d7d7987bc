use super::*;

#[test]
fn test_queue_spec_is_not_durable() {
    let spec = SubscriptionSpec::queue("STUDENT_API_TOPIC", "student-api");

    assert_eq!(spec.subject, "STUDENT_API_TOPIC");
    assert_eq!(spec.group, "student-api");
    assert!(!spec.durable);
}

#[test]
fn test_durable_spec_uses_name_as_group() {
    let spec = SubscriptionSpec::durable("STUDENT_EVENTS_ACK_TOPIC", "student-outbox-acks");

    assert_eq!(spec.group, "student-outbox-acks");
    assert!(spec.durable);
}

#[test]
fn test_connection_state_display() {
    assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    assert_eq!(ConnectionState::Closed.to_string(), "closed");
}

#[test]
fn test_timeout_error_names_duration() {
    let err = BusError::Timeout(Duration::from_millis(250));
    assert_eq!(err.to_string(), "Publish timed out after 250ms");
}

#[cfg(feature = "channel")]
#[tokio::test]
async fn test_init_connector_channel() {
    let config = Config::for_test();
    let connector = init_connector(&config).unwrap();

    let conn = connector.connect().await.unwrap();
    conn.publish("events", Bytes::from_static(b"{}")).await.unwrap();
}

#[cfg(not(feature = "nats"))]
#[test]
fn test_init_connector_nats_requires_feature() {
    let mut config = Config::for_test();
    config.messaging.messaging_type = MessagingType::Nats;

    assert!(matches!(
        init_connector(&config),
        Err(BusError::Connection(_))
    ));
}
