//! Terminal bridge tests over a real shell PTY.
//!
//! Validates:
//! - command output flows through capture exactly once, never re-emitted
//! - the transcript cursor only moves forward and lands in the store
//! - process exit surfaces as a session death notification
//! - spawn, send, and kill guard against sessions without a live terminal

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;

use agent_relay::models::session::SessionStatus;
use agent_relay::persistence::db;
use agent_relay::persistence::session_repo::SessionRepo;
use agent_relay::terminal::{SessionDeath, TerminalBridge};
use agent_relay::{RelayConfig, RelayError};

use super::test_helpers::{create_active_session, test_config};

struct BridgeHarness {
    state: tempfile::TempDir,
    config: Arc<RelayConfig>,
    sessions: SessionRepo,
    bridge: TerminalBridge,
    death_rx: mpsc::Receiver<SessionDeath>,
}

async fn harness() -> BridgeHarness {
    let state = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(state.path()));
    let database = Arc::new(db::connect_memory().await.expect("db connect"));
    let sessions = SessionRepo::new(database);
    let (death_tx, death_rx) = mpsc::channel(8);
    let bridge = TerminalBridge::new(Arc::clone(&config), sessions.clone(), death_tx);
    BridgeHarness {
        state,
        config,
        sessions,
        bridge,
        death_rx,
    }
}

#[tokio::test]
#[serial]
async fn command_output_is_captured_exactly_once() {
    let h = harness().await;
    let session = create_active_session(&h.sessions).await;

    let handle = h
        .bridge
        .spawn(&session.session_id, h.state.path(), 24, 80)
        .await
        .expect("spawn shell");
    assert!(handle.pid > 0);

    // The echoed input holds the expression, never the result, so the
    // result string can only come from shell output.
    h.bridge
        .send_keys(&session.session_id, "echo $((1234*2))\n")
        .await
        .expect("send keys");

    let mut seen = String::new();
    let mut last_offset = 0i64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let drained = h
            .bridge
            .capture(&session.session_id)
            .await
            .expect("capture");
        assert!(
            drained.char_offset >= last_offset,
            "transcript cursor went backwards"
        );
        last_offset = drained.char_offset;
        seen.push_str(&drained.text);
        if seen.contains("2468") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(seen.contains("2468"), "command output never surfaced: {seen:?}");

    // Further captures must not replay bytes already drained.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let drained = h
            .bridge
            .capture(&session.session_id)
            .await
            .expect("capture");
        assert!(drained.char_offset >= last_offset);
        last_offset = drained.char_offset;
        seen.push_str(&drained.text);
    }
    assert_eq!(seen.matches("2468").count(), 1, "output re-emitted: {seen:?}");

    let stored = h
        .sessions
        .get(&session.session_id)
        .await
        .expect("session row");
    assert_eq!(stored.native_process_id, Some(handle.pid));
    assert!(stored.char_offset > 0, "cursor never persisted");
    assert_eq!(stored.transcript_files.len(), 1);

    let transcript = h.config.transcripts_dir().join(&stored.transcript_files[0]);
    let contents = tokio::fs::read_to_string(&transcript)
        .await
        .expect("transcript file");
    assert!(contents.contains("2468"), "transcript missing output");

    h.bridge.kill(&session.session_id).await.expect("kill shell");
    assert!(!h.bridge.exists(&session.session_id).await);
}

#[tokio::test]
#[serial]
async fn process_exit_surfaces_as_session_death() {
    let mut h = harness().await;
    let session = create_active_session(&h.sessions).await;

    h.bridge
        .spawn(&session.session_id, h.state.path(), 24, 80)
        .await
        .expect("spawn shell");
    h.bridge
        .send_keys(&session.session_id, "exit\n")
        .await
        .expect("send exit");

    let death = tokio::time::timeout(Duration::from_secs(5), h.death_rx.recv())
        .await
        .expect("death notification in time")
        .expect("death channel open");
    assert_eq!(death.session_id, session.session_id);

    // The read loop removes the terminal before reporting the death.
    assert!(!h.bridge.exists(&session.session_id).await);
}

#[tokio::test]
#[serial]
async fn concurrent_spawns_attach_exactly_one_process() {
    let h = harness().await;
    let session = create_active_session(&h.sessions).await;

    let (first, second) = tokio::join!(
        h.bridge.spawn(&session.session_id, h.state.path(), 24, 80),
        h.bridge.spawn(&session.session_id, h.state.path(), 24, 80),
    );
    assert!(
        first.is_ok() != second.is_ok(),
        "exactly one spawn may win: first={first:?} second={second:?}"
    );
    let (winner, loser) = if first.is_ok() {
        (first, second)
    } else {
        (second, first)
    };
    let handle = winner.expect("winning spawn");
    assert!(matches!(
        loser.expect_err("rival spawn"),
        RelayError::ProcessSpawn(_)
    ));

    // Only the winner's process is linked to the session.
    let stored = h
        .sessions
        .get(&session.session_id)
        .await
        .expect("session row");
    assert_eq!(stored.native_process_id, Some(handle.pid));

    h.bridge.kill(&session.session_id).await.expect("kill shell");
    assert!(!h.bridge.exists(&session.session_id).await);
}

#[tokio::test]
#[serial]
async fn spawn_rejects_missing_closed_and_duplicate_sessions() {
    let h = harness().await;

    let err = h
        .bridge
        .spawn("no-such-session", h.state.path(), 24, 80)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RelayError::SessionNotFound(_)),
        "unexpected error: {err}"
    );

    let closed = create_active_session(&h.sessions).await;
    h.sessions
        .transition(&closed.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    h.sessions
        .transition(&closed.session_id, SessionStatus::Closed)
        .await
        .expect("to closed");
    let err = h
        .bridge
        .spawn(&closed.session_id, h.state.path(), 24, 80)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RelayError::ProcessSpawn(_)),
        "unexpected error: {err}"
    );

    let live = create_active_session(&h.sessions).await;
    h.bridge
        .spawn(&live.session_id, h.state.path(), 24, 80)
        .await
        .expect("first spawn");
    let err = h
        .bridge
        .spawn(&live.session_id, h.state.path(), 24, 80)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RelayError::ProcessSpawn(_)),
        "duplicate spawn must fail: {err}"
    );

    h.bridge.kill(&live.session_id).await.expect("kill shell");
}

#[tokio::test]
async fn terminal_calls_require_a_live_terminal() {
    let h = harness().await;
    let session = create_active_session(&h.sessions).await;

    let err = h
        .bridge
        .send_keys(&session.session_id, "ls\n")
        .await
        .unwrap_err();
    assert!(
        matches!(err, RelayError::Terminal(_)),
        "unexpected error: {err}"
    );
    let err = h.bridge.capture(&session.session_id).await.unwrap_err();
    assert!(
        matches!(err, RelayError::Terminal(_)),
        "unexpected error: {err}"
    );
    let err = h.bridge.kill(&session.session_id).await.unwrap_err();
    assert!(
        matches!(err, RelayError::Terminal(_)),
        "unexpected error: {err}"
    );
    assert!(!h.bridge.exists(&session.session_id).await);
}

#[tokio::test]
#[serial]
async fn shutdown_all_terminates_every_live_terminal() {
    let h = harness().await;
    let first = create_active_session(&h.sessions).await;
    let second = create_active_session(&h.sessions).await;
    h.bridge
        .spawn(&first.session_id, h.state.path(), 24, 80)
        .await
        .expect("spawn first");
    h.bridge
        .spawn(&second.session_id, h.state.path(), 24, 80)
        .await
        .expect("spawn second");

    h.bridge.shutdown_all().await;

    assert!(!h.bridge.exists(&first.session_id).await);
    assert!(!h.bridge.exists(&second.session_id).await);
}
