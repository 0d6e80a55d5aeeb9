//! Unit tests for the tagged hook event union.

use agent_relay::models::HookEvent;

#[test]
fn tool_use_carries_the_origin_discriminant() {
    let event = HookEvent::ToolUse {
        session_id: "sess-1".into(),
        tool_name: "bash".into(),
    };
    let value = serde_json::to_value(&event).expect("serialize");

    assert_eq!(value["origin"], "tool_use");
    assert_eq!(value["session_id"], "sess-1");
    assert_eq!(value["tool_name"], "bash");
}

#[test]
fn every_origin_round_trips() {
    let events = [
        HookEvent::ToolUse {
            session_id: "s".into(),
            tool_name: "edit".into(),
        },
        HookEvent::Checkpoint {
            session_id: "s".into(),
            label: Some("before refactor".into()),
        },
        HookEvent::Checkpoint {
            session_id: "s".into(),
            label: None,
        },
        HookEvent::Output {
            session_id: "s".into(),
            preview: Some("compiled ok".into()),
        },
        HookEvent::Notice {
            session_id: "s".into(),
            message: "build finished".into(),
        },
    ];

    for event in events {
        let json = serde_json::to_string(&event).expect("serialize");
        let back: HookEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}

#[test]
fn origin_names_match_the_wire_tag() {
    let checkpoint = HookEvent::Checkpoint {
        session_id: "s".into(),
        label: None,
    };
    assert_eq!(checkpoint.origin(), "checkpoint");

    let value = serde_json::to_value(&checkpoint).expect("serialize");
    assert_eq!(value["origin"], checkpoint.origin());
}

#[test]
fn session_id_accessor_covers_every_variant() {
    let events = [
        HookEvent::ToolUse {
            session_id: "a".into(),
            tool_name: "t".into(),
        },
        HookEvent::Checkpoint {
            session_id: "b".into(),
            label: None,
        },
        HookEvent::Output {
            session_id: "c".into(),
            preview: None,
        },
        HookEvent::Notice {
            session_id: "d".into(),
            message: "m".into(),
        },
    ];
    let ids: Vec<&str> = events.iter().map(HookEvent::session_id).collect();
    assert_eq!(ids, ["a", "b", "c", "d"]);
}

#[test]
fn unknown_origin_is_rejected() {
    let raw = r#"{"origin":"telemetry","session_id":"s"}"#;
    let result: Result<HookEvent, _> = serde_json::from_str(raw);
    assert!(result.is_err(), "unknown origin must fail, not default");
}

#[test]
fn missing_payload_field_is_rejected() {
    // tool_use without its tool_name is not a valid event.
    let raw = r#"{"origin":"tool_use","session_id":"s"}"#;
    let result: Result<HookEvent, _> = serde_json::from_str(raw);
    assert!(result.is_err(), "incomplete payload must fail");
}
