//! Unit tests for the session repository.
//!
//! Validates:
//! - create/get round trips and `SessionNotFound` for unknown ids
//! - the forward-only `active -> closing -> closed` transition chain
//! - closed sessions rejecting every mutation
//! - the monotonic `char_offset` guard
//! - process attachment and the transcript chain

use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_relay::models::session::{Session, SessionStatus, Visibility};
use agent_relay::persistence::db;
use agent_relay::persistence::session_repo::{SessionPatch, SessionRepo};
use agent_relay::RelayError;

async fn repo() -> SessionRepo {
    let pool = db::connect_memory().await.expect("db connect");
    SessionRepo::new(Arc::new(pool))
}

fn sample_session() -> Session {
    Session::new(
        "test-host".into(),
        "feature-branch".into(),
        Visibility::Shared,
        "developer".into(),
    )
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let repo = repo().await;
    let session = sample_session();

    let created = repo.create(&session).await.expect("create");
    assert_eq!(created.session_id, session.session_id);
    assert_eq!(created.computer_name, "test-host");
    assert_eq!(created.status, SessionStatus::Active);
    assert_eq!(created.char_offset, 0);
    assert_eq!(created.visibility, Visibility::Shared);

    let fetched = repo.get(&session.session_id).await.expect("get");
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn get_unknown_session_fails() {
    let repo = repo().await;
    let err = repo.get("no-such-session").await.expect_err("must fail");
    assert!(
        matches!(err, RelayError::SessionNotFound(ref id) if id == "no-such-session"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn transition_chain_reaches_closed() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");

    let closing = repo
        .transition(&session.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    assert_eq!(closing.status, SessionStatus::Closing);
    assert!(closing.closed_at.is_none());

    let closed = repo
        .transition(&session.session_id, SessionStatus::Closed)
        .await
        .expect("to closed");
    assert_eq!(closed.status, SessionStatus::Closed);
    assert!(closed.closed_at.is_some());
    assert!(closed.native_process_id.is_none());
    assert!(closed.pty_device.is_none());
}

#[tokio::test]
async fn skipping_closing_is_rejected() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");

    let err = repo
        .transition(&session.session_id, SessionStatus::Closed)
        .await
        .expect_err("active -> closed must fail");
    assert!(
        matches!(err, RelayError::IllegalTransition { ref from, ref to }
            if from == "active" && to == "closed"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn closed_session_admits_no_transition() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");
    repo.transition(&session.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    repo.transition(&session.session_id, SessionStatus::Closed)
        .await
        .expect("to closed");

    for next in [SessionStatus::Active, SessionStatus::Closing, SessionStatus::Closed] {
        let err = repo
            .transition(&session.session_id, next)
            .await
            .expect_err("closed is terminal");
        assert!(matches!(err, RelayError::IllegalTransition { .. }));
    }
}

#[tokio::test]
async fn closed_session_rejects_mutation() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");
    repo.transition(&session.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    repo.transition(&session.session_id, SessionStatus::Closed)
        .await
        .expect("to closed");

    let touch = repo.touch_activity(&session.session_id).await;
    assert!(matches!(touch, Err(RelayError::SessionClosed(_))));

    let advance = repo.advance_char_offset(&session.session_id, 100).await;
    assert!(matches!(advance, Err(RelayError::SessionClosed(_))));

    let patch = SessionPatch {
        user_role: Some("observer".into()),
        ..SessionPatch::default()
    };
    let update = repo.update_fields(&session.session_id, &patch).await;
    assert!(matches!(update, Err(RelayError::SessionClosed(_))));

    let attach = repo
        .attach_process(&session.session_id, 1234, None, "late.log")
        .await;
    assert!(attach.is_err(), "attach on closed session must fail");
}

#[tokio::test]
async fn char_offset_never_decreases() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");

    repo.advance_char_offset(&session.session_id, 100)
        .await
        .expect("advance to 100");
    repo.advance_char_offset(&session.session_id, 40)
        .await
        .expect("stale advance is a no-op");

    let fetched = repo.get(&session.session_id).await.expect("get");
    assert_eq!(fetched.char_offset, 100, "offset must not move backwards");
    assert!(fetched.last_output_at.is_some());

    repo.advance_char_offset(&session.session_id, 250)
        .await
        .expect("advance to 250");
    let fetched = repo.get(&session.session_id).await.expect("get");
    assert_eq!(fetched.char_offset, 250);
}

#[tokio::test]
async fn char_offset_still_moves_while_closing() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");
    repo.transition(&session.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");

    repo.advance_char_offset(&session.session_id, 64)
        .await
        .expect("drain during close");
    let fetched = repo.get(&session.session_id).await.expect("get");
    assert_eq!(fetched.char_offset, 64);
}

#[tokio::test]
async fn attach_process_extends_transcript_chain() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");

    let first = repo
        .attach_process(&session.session_id, 4321, Some("/dev/pts/7"), "run-1.log")
        .await
        .expect("first attach");
    assert_eq!(first.native_process_id, Some(4321));
    assert_eq!(first.pty_device.as_deref(), Some("/dev/pts/7"));
    assert_eq!(first.transcript_files, vec!["run-1.log".to_owned()]);

    let second = repo
        .attach_process(&session.session_id, 4322, None, "run-2.log")
        .await
        .expect("second attach");
    assert_eq!(second.native_process_id, Some(4322));
    assert_eq!(
        second.transcript_files,
        vec!["run-1.log".to_owned(), "run-2.log".to_owned()],
        "transcript chain keeps earlier files in order"
    );
}

#[tokio::test]
async fn update_fields_applies_only_set_fields() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");

    let stamp = Utc::now() - Duration::seconds(5);
    let patch = SessionPatch {
        last_tool_use_at: Some(stamp),
        ..SessionPatch::default()
    };
    let updated = repo
        .update_fields(&session.session_id, &patch)
        .await
        .expect("patch");

    assert!(updated.last_tool_use_at.is_some());
    assert!(updated.last_checkpoint_at.is_none());
    assert_eq!(updated.visibility, Visibility::Shared, "unset field untouched");
    assert_eq!(updated.user_role, "developer", "unset field untouched");
}

#[tokio::test]
async fn list_live_excludes_closed_sessions() {
    let repo = repo().await;

    let active = sample_session();
    repo.create(&active).await.expect("create active");

    let closing = sample_session();
    repo.create(&closing).await.expect("create closing");
    repo.transition(&closing.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");

    let closed = sample_session();
    repo.create(&closed).await.expect("create closed");
    repo.transition(&closed.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    repo.transition(&closed.session_id, SessionStatus::Closed)
        .await
        .expect("to closed");

    let live = repo.list_live().await.expect("list live");
    let ids: Vec<&str> = live.iter().map(|s| s.session_id.as_str()).collect();
    assert!(ids.contains(&active.session_id.as_str()));
    assert!(ids.contains(&closing.session_id.as_str()));
    assert!(!ids.contains(&closed.session_id.as_str()));

    assert_eq!(repo.count_active().await.expect("count"), 1);
}

#[tokio::test]
async fn list_recent_orders_by_last_activity() {
    let repo = repo().await;

    let older = sample_session();
    repo.create(&older).await.expect("create older");
    let newer = sample_session();
    repo.create(&newer).await.expect("create newer");

    // Touch the first session so it becomes the most recent.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    repo.touch_activity(&older.session_id).await.expect("touch");

    let recent = repo.list_recent().await.expect("list recent");
    assert_eq!(recent[0].session_id, older.session_id);
}

#[tokio::test]
async fn list_stuck_closing_honors_cutoff() {
    let repo = repo().await;
    let session = sample_session();
    repo.create(&session).await.expect("create");
    repo.transition(&session.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");

    // Cutoff before the transition: nothing is stuck yet.
    let early = repo
        .list_stuck_closing(Utc::now() - Duration::seconds(60))
        .await
        .expect("list");
    assert!(early.is_empty());

    // Cutoff after the transition: the session counts as stuck.
    let late = repo
        .list_stuck_closing(Utc::now() + Duration::seconds(60))
        .await
        .expect("list");
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].session_id, session.session_id);
}
