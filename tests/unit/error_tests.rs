//! Unit tests for the error taxonomy.

use agent_relay::{RelayConfig, RelayError};

#[test]
fn display_formats_name_the_failure_mode() {
    let illegal = RelayError::IllegalTransition {
        from: "closed".into(),
        to: "active".into(),
    };
    assert_eq!(illegal.to_string(), "illegal transition: closed -> active");

    let missing = RelayError::SessionNotFound("sess-42".into());
    assert_eq!(missing.to_string(), "session not found: sess-42");

    let closed = RelayError::SessionClosed("sess-42".into());
    assert_eq!(closed.to_string(), "session closed: sess-42");

    assert_eq!(RelayError::LeaseConflict.to_string(), "lease conflict");

    let transient = RelayError::TransientDelivery("rate limited".into());
    assert_eq!(
        transient.to_string(),
        "transient delivery failure: rate limited"
    );

    let permanent = RelayError::PermanentDelivery("channel archived".into());
    assert_eq!(
        permanent.to_string(),
        "permanent delivery failure: channel archived"
    );
}

#[test]
fn toml_errors_convert_to_config() {
    let err = RelayConfig::from_toml_str("not valid toml [[[").expect_err("must fail");
    assert!(matches!(err, RelayError::Config(_)));
    assert!(err.to_string().starts_with("config:"));
}

#[test]
fn io_errors_convert_to_io() {
    // The intake codec relies on this conversion to satisfy the
    // tokio-util Decoder/Encoder error bound.
    fn assert_from_io<E: From<std::io::Error>>() {}
    assert_from_io::<RelayError>();

    let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = RelayError::from(io_err);
    assert!(matches!(err, RelayError::Io(_)));
    assert!(err.to_string().contains("pipe closed"));
}

#[test]
fn sqlx_errors_convert_to_db() {
    let err: RelayError = sqlx::Error::RowNotFound.into();
    assert!(matches!(err, RelayError::Db(_)));
    assert!(err.to_string().starts_with("db:"));
}

#[test]
fn errors_implement_std_error() {
    fn assert_error<E: std::error::Error>(_: &E) {}
    assert_error(&RelayError::LeaseConflict);
}
