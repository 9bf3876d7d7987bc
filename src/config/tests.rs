use super::*;
use serial_test::serial;
use std::io::Write;

fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
    assert_eq!(config.outbox.ack_mode, AckMode::Immediate);
    assert!(config.outbox.publish_on_commit);
    assert_eq!(config.purge.retention_days, 7);
    assert_eq!(config.messaging.topics.command, "STUDENT_API_TOPIC");
}

#[test]
fn test_for_test_uses_memory_and_no_jitter() {
    let config = Config::for_test();
    assert_eq!(config.storage.path, ":memory:");
    assert!(!config.reconnect.jitter);
}

#[test]
fn test_validate_rejects_zero_batch() {
    let mut config = Config::default();
    config.outbox.batch_size = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_inverted_lease() {
    let mut config = Config::default();
    config.outbox.lock_at_least_ms = config.outbox.lock_at_most_ms + 1;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_yaml(
        r#"
messaging:
  type: nats
  nats:
    url: "nats://broker:4222"
  topics:
    command: "CUSTOM_API"
outbox:
  ack_mode: deferred
  batch_size: 10
purge:
  retention_days: 30
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.messaging.messaging_type, MessagingType::Nats);
    assert_eq!(config.messaging.nats.url, "nats://broker:4222");
    assert_eq!(config.messaging.topics.command, "CUSTOM_API");
    // Unset keys keep their defaults.
    assert_eq!(config.messaging.topics.events, "STUDENT_EVENTS_TOPIC");
    assert_eq!(config.outbox.ack_mode, AckMode::Deferred);
    assert_eq!(config.outbox.batch_size, 10);
    assert_eq!(config.purge.retention_days, 30);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_yaml("outbox:\n  batch_size: 10\n");
    std::env::set_var("STUDENT_OUTBOX__OUTBOX__BATCH_SIZE", "25");

    let result = Config::load(file.path().to_str());
    std::env::remove_var("STUDENT_OUTBOX__OUTBOX__BATCH_SIZE");

    assert_eq!(result.unwrap().outbox.batch_size, 25);
}

#[test]
#[serial]
fn test_invalid_file_contents_rejected() {
    let file = write_yaml("dispatcher:\n  workers: 0\n");
    assert!(matches!(
        Config::load(file.path().to_str()),
        Err(ConfigError::Invalid(_))
    ));
}
