#![forbid(unsafe_code)]

//! `agent-relay` — session relay daemon binary.
//!
//! Bootstraps configuration, the terminal bridge, the local-socket event
//! intake, the durable outbox dispatcher, and the staleness sweep.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::adapters::SlackGateway;
use agent_relay::intake::{spawn_intake_server, EventSink};
use agent_relay::listener::{ListenerRegistry, ListenerTransport};
use agent_relay::orchestrator::{
    spawn_death_consumer, spawn_sweep_task, EventRouter, RelayTransport, SessionLifecycle,
};
use agent_relay::outbox::{spawn_outbox_dispatcher, AdapterGateway, NullGateway};
use agent_relay::persistence::db;
use agent_relay::persistence::listener_repo::ListenerRepo;
use agent_relay::persistence::outbox_repo::OutboxRepo;
use agent_relay::persistence::session_repo::SessionRepo;
use agent_relay::terminal::{SessionDeath, TerminalBridge};
use agent_relay::{RelayConfig, RelayError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Session relay daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the state directory from the configuration file.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay daemon bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| RelayError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

#[allow(clippy::too_many_lines)] // Bootstrap wiring is inherently sequential.
async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| RelayError::Config(format!("cannot read config: {err}")))?;
    let mut config = RelayConfig::from_toml_str(&config_text)?;

    // Override state directory from CLI if provided.
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    // Load adapter credentials from keyring / env vars.
    config.load_credentials().await?;

    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let database = Arc::new(db::connect(&config).await?);
    info!("database connected");

    let sessions = SessionRepo::new(Arc::clone(&database));
    let outbox = OutboxRepo::new(Arc::clone(&database));
    let listeners = ListenerRepo::new(Arc::clone(&database));

    // ── Build the terminal bridge ───────────────────────
    let (death_tx, death_rx) = mpsc::channel::<SessionDeath>(64);
    let bridge = TerminalBridge::new(Arc::clone(&config), sessions.clone(), death_tx);

    // Build the delivery gateway if Slack is configured.
    let slack_configured = config.adapters.slack.is_some();
    let gateway: Arc<dyn AdapterGateway> = match config.adapters.slack {
        Some(ref slack) => {
            let gateway = Arc::new(SlackGateway::new(slack.bot_token.clone())?);
            info!("slack gateway initialized");
            gateway
        }
        None => {
            info!("slack not configured; running in local-only mode");
            Arc::new(NullGateway)
        }
    };

    // ── Assemble the orchestrator ───────────────────────
    let transport: Arc<dyn ListenerTransport> =
        Arc::new(RelayTransport::new(bridge.clone(), Arc::clone(&gateway)));
    let registry = ListenerRegistry::new(sessions.clone(), listeners.clone(), transport);
    let lifecycle = SessionLifecycle::new(
        Arc::clone(&config),
        sessions.clone(),
        outbox.clone(),
        registry.clone(),
        bridge.clone(),
    );

    // ── Reconcile sessions left over from a prior run ───
    lifecycle.startup_recovery().await?;

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();

    let router: Arc<dyn EventSink> = Arc::new(EventRouter::new(
        Arc::clone(&config),
        sessions.clone(),
        outbox.clone(),
        registry.clone(),
    ));
    let intake_handle = spawn_intake_server(router, &config.intake, ct.clone())?;
    info!("event intake listening");

    // Without an adapter the dispatcher would burn attempts on entries
    // that cannot be delivered, so enqueued entries stay pending instead.
    let dispatcher_handle = if slack_configured {
        Some(spawn_outbox_dispatcher(
            outbox.clone(),
            Arc::clone(&gateway),
            config.outbox.clone(),
            ct.clone(),
        ))
    } else {
        None
    };

    let death_handle = spawn_death_consumer(lifecycle.clone(), death_rx, ct.clone());
    let sweep_handle = spawn_sweep_task(
        lifecycle.clone(),
        sessions.clone(),
        outbox.clone(),
        config.sweep.clone(),
        ct.clone(),
    );

    info!("agent-relay daemon ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // Close live sessions through the normal path; pending outbox
    // entries stay put for the next run.
    match sessions.list_live().await {
        Ok(live) => {
            for session in live {
                if let Err(err) = lifecycle.force_close(&session.session_id).await {
                    warn!(session_id = %session.session_id, %err, "failed to close session at shutdown");
                }
            }
        }
        Err(err) => warn!(%err, "failed to list live sessions at shutdown"),
    }

    // Kill any terminal the close pass missed before the runtime goes away.
    bridge.shutdown_all().await;

    // ── Wait for background tasks ───────────────────────
    let _ = tokio::join!(intake_handle, death_handle, sweep_handle);
    if let Some(handle) = dispatcher_handle {
        let _ = handle.await;
    }
    info!("agent-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| RelayError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| RelayError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
