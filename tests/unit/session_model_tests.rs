//! Unit tests for the session model and its lifecycle rules.

use agent_relay::models::session::{Session, SessionStatus, Visibility};

fn sample_session() -> Session {
    Session::new(
        "test-host".into(),
        "feature-branch".into(),
        Visibility::Private,
        "developer".into(),
    )
}

#[test]
fn new_session_starts_active_with_zero_offset() {
    let session = sample_session();

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.char_offset, 0);
    assert!(session.closed_at.is_none());
    assert!(session.native_process_id.is_none());
    assert!(session.pty_device.is_none());
    assert!(session.transcript_files.is_empty());
    assert!(session.last_tool_use_at.is_none());
    assert!(!session.session_id.is_empty());
}

#[test]
fn new_sessions_get_distinct_ids() {
    let a = sample_session();
    let b = sample_session();
    assert_ne!(a.session_id, b.session_id);
}

#[test]
fn lifecycle_moves_forward_only() {
    let mut session = sample_session();

    assert!(session.can_transition_to(SessionStatus::Closing));
    assert!(!session.can_transition_to(SessionStatus::Closed));
    assert!(!session.can_transition_to(SessionStatus::Active));

    session.status = SessionStatus::Closing;
    assert!(session.can_transition_to(SessionStatus::Closed));
    assert!(!session.can_transition_to(SessionStatus::Active));
    assert!(!session.can_transition_to(SessionStatus::Closing));

    session.status = SessionStatus::Closed;
    assert!(!session.can_transition_to(SessionStatus::Active));
    assert!(!session.can_transition_to(SessionStatus::Closing));
    assert!(!session.can_transition_to(SessionStatus::Closed));
}

#[test]
fn closed_is_the_only_terminal_status() {
    assert!(!SessionStatus::Active.is_terminal());
    assert!(!SessionStatus::Closing.is_terminal());
    assert!(SessionStatus::Closed.is_terminal());
}

#[test]
fn status_serializes_to_snake_case() {
    assert_eq!(
        serde_json::to_string(&SessionStatus::Active).expect("serialize"),
        "\"active\""
    );
    assert_eq!(
        serde_json::to_string(&SessionStatus::Closing).expect("serialize"),
        "\"closing\""
    );
    assert_eq!(
        serde_json::to_string(&SessionStatus::Closed).expect("serialize"),
        "\"closed\""
    );
}

#[test]
fn visibility_round_trips_through_serde() {
    for (value, wire) in [(Visibility::Private, "\"private\""), (Visibility::Shared, "\"shared\"")] {
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, wire);
        let back: Visibility = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }
}

#[test]
fn unknown_status_fails_deserialization() {
    let result: Result<SessionStatus, _> = serde_json::from_str("\"paused\"");
    assert!(result.is_err(), "unknown status should fail to deserialize");
}
