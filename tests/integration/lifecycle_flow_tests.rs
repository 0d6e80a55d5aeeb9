//! Session lifecycle tests: open, close, process death, recovery, sweep.
//!
//! Validates:
//! - open spawns the agent and close walks active through closing to
//!   closed, dropping the session's listener interests on the way
//! - a spawn failure archives the just-created record
//! - a process death archives the session once and notifies watchers
//! - startup recovery and the staleness sweep archive leftover sessions
//!   and purge delivered outbox rows past retention

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serial_test::serial;
use tokio::sync::mpsc;

use agent_relay::listener::{ListenerRegistry, ListenerTransport};
use agent_relay::models::outbox::{NotificationPayload, OutboxEntry};
use agent_relay::models::session::{SessionStatus, Visibility};
use agent_relay::models::HookEvent;
use agent_relay::orchestrator::sweep::run_sweep;
use agent_relay::orchestrator::{OpenSessionParams, SessionLifecycle};
use agent_relay::persistence::db::Database;
use agent_relay::persistence::listener_repo::ListenerRepo;
use agent_relay::persistence::outbox_repo::OutboxRepo;
use agent_relay::persistence::session_repo::SessionRepo;
use agent_relay::terminal::{SessionDeath, TerminalBridge};
use agent_relay::{RelayConfig, RelayError};

use super::test_helpers::{
    create_active_session, memory_db, test_config, test_config_with_slack, RecordingTransport,
};

struct LifecycleHarness {
    state: tempfile::TempDir,
    config: Arc<RelayConfig>,
    database: Arc<Database>,
    sessions: SessionRepo,
    outbox: OutboxRepo,
    registry: ListenerRegistry,
    transport: Arc<RecordingTransport>,
    bridge: TerminalBridge,
    lifecycle: SessionLifecycle,
    death_rx: mpsc::Receiver<SessionDeath>,
}

async fn build(state: tempfile::TempDir, config: RelayConfig) -> LifecycleHarness {
    let config = Arc::new(config);
    let database = memory_db().await;
    let sessions = SessionRepo::new(Arc::clone(&database));
    let outbox = OutboxRepo::new(Arc::clone(&database));
    let transport = RecordingTransport::new();
    let registry = ListenerRegistry::new(
        sessions.clone(),
        ListenerRepo::new(Arc::clone(&database)),
        Arc::clone(&transport) as Arc<dyn ListenerTransport>,
    );
    let (death_tx, death_rx) = mpsc::channel(8);
    let bridge = TerminalBridge::new(Arc::clone(&config), sessions.clone(), death_tx);
    let lifecycle = SessionLifecycle::new(
        Arc::clone(&config),
        sessions.clone(),
        outbox.clone(),
        registry.clone(),
        bridge.clone(),
    );
    LifecycleHarness {
        state,
        config,
        database,
        sessions,
        outbox,
        registry,
        transport,
        bridge,
        lifecycle,
        death_rx,
    }
}

async fn harness(with_slack: bool) -> LifecycleHarness {
    let state = tempfile::tempdir().expect("tempdir");
    let config = if with_slack {
        test_config_with_slack(state.path())
    } else {
        test_config(state.path())
    };
    build(state, config).await
}

fn open_params(h: &LifecycleHarness) -> OpenSessionParams {
    OpenSessionParams {
        working_slug: "demo-task".into(),
        workspace: h.state.path().to_path_buf(),
        visibility: Visibility::Private,
        user_role: "developer".into(),
    }
}

#[tokio::test]
#[serial]
async fn open_and_close_walk_the_full_lifecycle() {
    let h = harness(false).await;

    let (session, handle) = h
        .lifecycle
        .open_session(open_params(&h))
        .await
        .expect("open session");
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.native_process_id, Some(handle.pid));
    assert_eq!(session.transcript_files.len(), 1);
    assert!(h.bridge.exists(&session.session_id).await);

    // The session watches another one; closing must drop that interest.
    let target = create_active_session(&h.sessions).await;
    h.registry
        .subscribe(
            &target.session_id,
            &session.session_id,
            &format!("terminal:{}", session.session_id),
        )
        .await
        .expect("subscribe");

    let closed = h
        .lifecycle
        .close_session(&session.session_id)
        .await
        .expect("close session");
    assert_eq!(closed.status, SessionStatus::Closed);
    assert!(closed.closed_at.is_some());
    assert!(closed.native_process_id.is_none());
    assert!(!h.bridge.exists(&session.session_id).await);

    let attempts = h
        .registry
        .publish(
            &target.session_id,
            &HookEvent::Notice {
                session_id: target.session_id.clone(),
                message: "ping".into(),
            },
        )
        .await
        .expect("publish");
    assert!(attempts.is_empty(), "closed session kept its interests");
}

#[tokio::test]
async fn spawn_failure_archives_the_session() {
    let state = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(state.path());
    config.agent_cli = "agent-relay-no-such-binary".into();
    let h = build(state, config).await;

    let err = h.lifecycle.open_session(open_params(&h)).await.unwrap_err();
    assert!(
        matches!(err, RelayError::ProcessSpawn(_)),
        "unexpected error: {err}"
    );

    let rows = h.sessions.list_recent().await.expect("list sessions");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SessionStatus::Closed, "record not archived");
    assert_eq!(h.sessions.count_active().await.expect("count"), 0);
}

#[tokio::test]
#[serial]
async fn process_death_archives_once_and_notifies_watchers() {
    let mut h = harness(true).await;

    let (session, _handle) = h
        .lifecycle
        .open_session(open_params(&h))
        .await
        .expect("open session");
    h.registry
        .subscribe(&session.session_id, "watcher", "channel:C_WATCH")
        .await
        .expect("subscribe watcher");

    h.bridge
        .send_keys(&session.session_id, "exit\n")
        .await
        .expect("send exit");
    let death = tokio::time::timeout(StdDuration::from_secs(5), h.death_rx.recv())
        .await
        .expect("death notification in time")
        .expect("death channel open");

    h.lifecycle.handle_death(&death).await;

    let stored = h
        .sessions
        .get(&session.session_id)
        .await
        .expect("session row");
    assert_eq!(stored.status, SessionStatus::Closed);
    assert!(stored.closed_at.is_some());

    let sent = h.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "channel:C_WATCH");
    match &sent[0].1 {
        HookEvent::Notice { message, .. } => {
            assert!(message.contains("exited"), "unexpected notice: {message}");
        }
        other => panic!("expected a notice, got {other:?}"),
    }
    assert_eq!(h.outbox.count_pending().await.expect("count"), 1);

    // A duplicate death report must change nothing.
    h.lifecycle.handle_death(&death).await;
    assert_eq!(h.transport.sent().await.len(), 1);
    assert_eq!(h.outbox.count_pending().await.expect("count"), 1);
}

#[tokio::test]
async fn death_reports_for_unknown_sessions_are_ignored() {
    let h = harness(false).await;

    h.lifecycle
        .handle_death(&SessionDeath {
            session_id: "ghost-session".into(),
            exit_code: None,
        })
        .await;

    assert!(h.sessions.list_recent().await.expect("list").is_empty());
}

#[tokio::test]
async fn force_close_handles_every_live_state() {
    let h = harness(false).await;

    // Stuck in closing: completed to closed.
    let stuck = create_active_session(&h.sessions).await;
    h.sessions
        .transition(&stuck.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    let closed = h
        .lifecycle
        .force_close(&stuck.session_id)
        .await
        .expect("force close closing");
    assert_eq!(closed.status, SessionStatus::Closed);
    assert!(closed.closed_at.is_some());

    // Already closed: returned untouched.
    let again = h
        .lifecycle
        .force_close(&stuck.session_id)
        .await
        .expect("force close closed");
    assert_eq!(again.closed_at, closed.closed_at);

    // Active without a live terminal: normal close path.
    let quiet = create_active_session(&h.sessions).await;
    let closed = h
        .lifecycle
        .force_close(&quiet.session_id)
        .await
        .expect("force close active");
    assert_eq!(closed.status, SessionStatus::Closed);
}

#[tokio::test]
async fn startup_recovery_archives_leftover_sessions() {
    let h = harness(false).await;

    // Active with a recorded pid that cannot be alive.
    let orphan = create_active_session(&h.sessions).await;
    h.sessions
        .attach_process(&orphan.session_id, 4_000_000_000, None, "stale-run.log")
        .await
        .expect("attach stale pid");
    // Stuck mid-close from the previous run.
    let closing = create_active_session(&h.sessions).await;
    h.sessions
        .transition(&closing.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    // Active that never got a process.
    let pidless = create_active_session(&h.sessions).await;

    h.lifecycle.startup_recovery().await.expect("recovery");

    for id in [
        &orphan.session_id,
        &closing.session_id,
        &pidless.session_id,
    ] {
        let stored = h.sessions.get(id).await.expect("session row");
        assert_eq!(stored.status, SessionStatus::Closed, "session {id} not archived");
    }
    assert_eq!(h.sessions.count_active().await.expect("count"), 0);
}

#[tokio::test]
async fn sweep_completes_stuck_closing_and_purges_delivered() {
    let h = harness(false).await;

    // Closing long past the one second timeout in the test config.
    let stuck = create_active_session(&h.sessions).await;
    h.sessions
        .transition(&stuck.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");
    sqlx::query("UPDATE session SET last_activity = ?2 WHERE session_id = ?1")
        .bind(&stuck.session_id)
        .bind((Utc::now() - Duration::seconds(60)).to_rfc3339())
        .execute(h.database.as_ref())
        .await
        .expect("backdate closing session");

    // Freshly closing: inside the timeout, must be left alone.
    let fresh = create_active_session(&h.sessions).await;
    h.sessions
        .transition(&fresh.session_id, SessionStatus::Closing)
        .await
        .expect("to closing");

    // One delivered entry past retention, one recent, one failed.
    let old = h
        .outbox
        .enqueue(&OutboxEntry::new(
            "slack".into(),
            "C_TEST".into(),
            NotificationPayload::new("old news".into()),
        ))
        .await
        .expect("enqueue old");
    h.outbox.mark_delivered(&old.id).await.expect("deliver old");
    sqlx::query("UPDATE outbox SET delivered_at = ?2 WHERE id = ?1")
        .bind(&old.id)
        .bind((Utc::now() - Duration::days(3)).to_rfc3339())
        .execute(h.database.as_ref())
        .await
        .expect("backdate delivery");

    let recent = h
        .outbox
        .enqueue(&OutboxEntry::new(
            "slack".into(),
            "C_TEST".into(),
            NotificationPayload::new("fresh news".into()),
        ))
        .await
        .expect("enqueue recent");
    h.outbox
        .mark_delivered(&recent.id)
        .await
        .expect("deliver recent");

    let parked = h
        .outbox
        .enqueue(&OutboxEntry::new(
            "slack".into(),
            "C_TEST".into(),
            NotificationPayload::new("doomed".into()),
        ))
        .await
        .expect("enqueue parked");
    h.outbox
        .mark_failed(&parked.id, "adapter gone")
        .await
        .expect("park entry");

    run_sweep(&h.lifecycle, &h.sessions, &h.outbox, &h.config.sweep).await;

    let stored = h.sessions.get(&stuck.session_id).await.expect("stuck row");
    assert_eq!(stored.status, SessionStatus::Closed);
    let stored = h.sessions.get(&fresh.session_id).await.expect("fresh row");
    assert_eq!(stored.status, SessionStatus::Closing, "fresh close swept early");

    assert!(
        h.outbox.find(&old.id).await.expect("find old").is_none(),
        "expired delivered entry kept"
    );
    assert!(
        h.outbox.find(&recent.id).await.expect("find recent").is_some(),
        "recent delivered entry purged"
    );
    assert!(
        h.outbox.find(&parked.id).await.expect("find parked").is_some(),
        "failed entries must never be purged"
    );
}
