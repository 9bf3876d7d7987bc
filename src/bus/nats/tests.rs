use super::*;

fn connector() -> NatsConnector {
    NatsConnector::new(NatsSettings::default(), TopicsConfig::default())
}

#[test]
fn test_stream_covers_events_and_acks() {
    let config = connector().stream_config();

    assert_eq!(config.name, "STUDENT_EVENTS");
    assert_eq!(
        config.subjects,
        vec![
            "STUDENT_EVENTS_TOPIC".to_string(),
            "STUDENT_EVENTS_ACK_TOPIC".to_string()
        ]
    );
    assert_eq!(config.max_age, Duration::from_secs(7 * 24 * 60 * 60));
}

#[test]
fn test_stream_subjects_collapse_when_equal() {
    let topics = TopicsConfig {
        acks: "STUDENT_EVENTS_TOPIC".to_string(),
        ..TopicsConfig::default()
    };
    let connector = NatsConnector::new(NatsSettings::default(), topics);

    assert_eq!(connector.stream_subjects(), vec!["STUDENT_EVENTS_TOPIC"]);
}

#[test]
fn test_durable_consumer_uses_explicit_acks() {
    let spec = SubscriptionSpec::durable("STUDENT_EVENTS_ACK_TOPIC", "student-outbox-acks");
    let config = consumer_config(&spec, Duration::from_secs(30));

    assert_eq!(config.durable_name.as_deref(), Some("student-outbox-acks"));
    assert_eq!(config.filter_subject, "STUDENT_EVENTS_ACK_TOPIC");
    assert_eq!(config.ack_policy, AckPolicy::Explicit);
    assert_eq!(config.ack_wait, Duration::from_secs(30));
}

#[tokio::test]
async fn test_connect_to_unreachable_server_fails() {
    let settings = NatsSettings {
        url: "nats://127.0.0.1:1".to_string(),
        connect_timeout_ms: 500,
        ..NatsSettings::default()
    };
    let connector = NatsConnector::new(settings, TopicsConfig::default());

    let result = tokio::time::timeout(Duration::from_secs(10), connector.connect())
        .await
        .expect("connect should give up");

    assert!(matches!(result, Err(BusError::Connection(_))));
}
