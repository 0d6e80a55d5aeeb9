#![forbid(unsafe_code)]

//! `agent-relay-hook` — best-effort hook event forwarder.
//!
//! Invoked by agent-side hooks to ship one event into the daemon's intake
//! socket. The whole exchange is best-effort by contract: every failure is
//! printed to stderr and discarded, and the process always exits 0 so a
//! missing or wedged daemon can never break the agent that fired the hook.

use std::io::Read;

use clap::Parser;

use agent_relay::config::IntakeConfig;
use agent_relay::intake::client::forward_event;
use agent_relay::intake::protocol::ForwardParams;

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-hook",
    about = "Forward one hook event to the agent-relay daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Origin-tagged event JSON. Read from stdin when omitted.
    #[arg(long)]
    event_json: Option<String>,

    /// Intake socket name (must match the daemon's `intake.socket_name`).
    #[arg(long, default_value = "agent-relay")]
    socket_name: String,

    /// Budget for the whole connect-and-forward exchange, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    timeout_ms: u64,
}

fn main() {
    let args = Cli::parse();

    let raw = match args.event_json {
        Some(raw) => raw,
        None => {
            let mut buf = String::new();
            if let Err(err) = std::io::stdin().read_to_string(&mut buf) {
                eprintln!("agent-relay-hook: cannot read stdin: {err}");
                return;
            }
            buf
        }
    };

    let params: ForwardParams = match serde_json::from_str(raw.trim()) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("agent-relay-hook: unrecognized event payload: {err}");
            return;
        }
    };
    let event = params.into_event();

    let config = IntakeConfig {
        socket_name: args.socket_name,
        connect_timeout_ms: args.timeout_ms,
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("agent-relay-hook: cannot build runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(forward_event(&config, &event)) {
        eprintln!("agent-relay-hook: forward failed (daemon offline?): {err}");
    }
}
