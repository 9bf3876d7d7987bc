use super::*;
use chrono::Utc;
use uuid::Uuid;

fn record(event_type: EventType, outcome: EventOutcome) -> EventRecord {
    EventRecord::new(
        Uuid::new_v4(),
        Some(Uuid::new_v4()),
        event_type,
        outcome,
        r#"{"pen":"123456789"}"#.to_string(),
        "student-api",
        Utc::now(),
    )
}

#[test]
fn test_status_parses_both_spellings() {
    assert_eq!("DB_COMMITTED".parse::<EventStatus>().unwrap(), EventStatus::DbCommitted);
    assert_eq!("PENDING".parse::<EventStatus>().unwrap(), EventStatus::DbCommitted);
    assert_eq!(
        "MESSAGE_PUBLISHED".parse::<EventStatus>().unwrap(),
        EventStatus::MessagePublished
    );
    assert!("SENT".parse::<EventStatus>().is_err());
}

#[test]
fn test_status_never_regresses() {
    assert!(EventStatus::DbCommitted.can_advance_to(EventStatus::MessagePublished));
    assert!(EventStatus::MessagePublished.can_advance_to(EventStatus::MessagePublished));
    assert!(!EventStatus::MessagePublished.can_advance_to(EventStatus::DbCommitted));
}

#[test]
fn test_event_type_storage_text_matches_wire_text() {
    for event_type in EventType::all() {
        let json = serde_json::to_string(event_type).unwrap();
        assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), *event_type);
    }
}

#[test]
fn test_new_record_is_pending_with_audit() {
    let record = record(EventType::CreateStudent, EventOutcome::StudentCreated);
    assert!(record.is_pending());
    assert_eq!(record.created_by, "student-api");
    assert_eq!(record.created_at, record.updated_at);
    assert!(record.published_at.is_none());
}

#[test]
fn test_event_wire_shape_is_camel_case() {
    let saga = Uuid::new_v4();
    let event = Event::new(EventType::CreateStudent, Some(saga), "{}".to_string())
        .with_reply_to("_INBOX.abc");
    let value: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

    assert_eq!(value["eventType"], "CREATE_STUDENT");
    assert_eq!(value["payloadVersion"], PAYLOAD_VERSION);
    assert_eq!(value["sagaId"], saga.to_string());
    assert_eq!(value["replyTo"], "_INBOX.abc");
    assert!(value.get("eventID").is_none());
}

#[test]
fn test_choreographed_event_carries_event_id() {
    let record = record(EventType::UpdateStudent, EventOutcome::StudentUpdated);
    let copy = ChoreographedEvent::from_record(&record);
    let value: serde_json::Value = serde_json::from_slice(&copy.to_bytes().unwrap()).unwrap();

    assert_eq!(value["eventID"], record.event_id.to_string());
    assert_eq!(value["eventOutcome"], "STUDENT_UPDATED");

    let ack = copy.acknowledgment();
    assert_eq!(ack.event_type, EventType::OutboxProcessed);
    assert_eq!(ack.event_payload, record.event_id.to_string());
}

#[test]
fn test_decode_known_event() {
    let bytes = br#"{"eventType":"GET_STUDENT","eventPayload":"{}"}"#;
    match decode_event(bytes).unwrap() {
        Decoded::Known(event) => {
            assert_eq!(event.event_type, EventType::GetStudent);
            assert_eq!(event.payload_version, PAYLOAD_VERSION);
            assert!(event.saga_id.is_none());
        }
        other => panic!("expected known event, got {:?}", other),
    }
}

#[test]
fn test_decode_unknown_event_type_is_not_an_error() {
    let bytes = br#"{"eventType":"ADD_POSSIBLE_MATCH","eventPayload":"[]"}"#;
    assert_eq!(
        decode_event(bytes).unwrap(),
        Decoded::Unsupported {
            event_type: "ADD_POSSIBLE_MATCH".to_string(),
            saga_id: None
        }
    );
}

#[test]
fn test_decode_malformed_payload_fails() {
    assert!(decode_event(b"not json").is_err());
    assert!(decode_event(br#"{"eventPayload":"{}"}"#).is_err());
}

#[test]
fn test_student_flattens_fields_and_audit() {
    let now = Utc::now();
    let student = Student {
        student_id: Uuid::new_v4(),
        fields: StudentDraft {
            pen: "123456789".to_string(),
            legal_last_name: "Wayne".to_string(),
            sex_code: Some("M".to_string()),
            ..Default::default()
        },
        audit: Audit::created("api", now),
    };

    let value = serde_json::to_value(&student).unwrap();
    assert_eq!(value["pen"], "123456789");
    assert_eq!(value["legalLastName"], "Wayne");
    assert_eq!(value["createdBy"], "api");

    let back: Student = serde_json::from_value(value).unwrap();
    assert_eq!(back, student);
}

#[test]
fn test_audit_touch_keeps_creation_stamp() {
    let created = Audit::created("alice", Utc::now());
    let later = created.created_at + chrono::Duration::seconds(5);
    let touched = created.touched("bob", later);

    assert_eq!(touched.created_by, "alice");
    assert_eq!(touched.created_at, created.created_at);
    assert_eq!(touched.updated_by, "bob");
    assert_eq!(touched.updated_at, later);
}
