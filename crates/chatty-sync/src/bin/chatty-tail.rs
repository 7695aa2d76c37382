//! Tail a conversation from the terminal.
//!
//! Connects the sync engine to a running backend, prints the timeline as
//! it changes, and optionally sends one message on startup. Useful for
//! smoke-testing a deployment without the web client.

use anyhow::Result;
use clap::Parser;
use uuid::Uuid;

use chatty_sync::{ConnectionState, ConversationPair, DeliveryMode, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "chatty-tail", about = "Tail a Chatty conversation")]
struct Args {
    /// REST base URL of the backend.
    #[arg(long, env = "CHATTY_API_URL", default_value = "http://localhost:8080/api")]
    api_url: String,

    /// Your user id.
    #[arg(long)]
    user: Uuid,

    /// The other participant's user id.
    #[arg(long)]
    peer: Uuid,

    /// Use the long-poll fallback instead of the broker channel.
    #[arg(long)]
    poll: bool,

    /// Send this message once connected.
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = SyncConfig {
        api_base_url: args.api_url,
        delivery: if args.poll {
            DeliveryMode::Polling
        } else {
            DeliveryMode::Live
        },
        ..SyncConfig::default()
    };

    let engine = SyncEngine::start(config, ConversationPair::new(args.user, args.peer));
    engine.connect();

    let mut timeline_rx = engine.watch_timeline();
    let mut state_rx = engine.watch_connection_state();
    let mut sent = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                eprintln!("-- connection: {state:?}");
                if state == ConnectionState::Connected && !sent {
                    if let Some(text) = args.send.as_deref() {
                        engine.send(text);
                    }
                    sent = true;
                }
                if let ConnectionState::Error(reason) = state {
                    eprintln!("-- error: {reason}");
                }
            }
            changed = timeline_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = timeline_rx.borrow_and_update().clone();
                if let Some(entry) = entries.last() {
                    let marker = if entry.failed {
                        " [failed]"
                    } else if entry.pending {
                        " [pending]"
                    } else {
                        ""
                    };
                    println!(
                        "[{}] {} -> {}: {}{marker}",
                        entry.message.created_at,
                        entry.message.sender,
                        entry.message.receiver,
                        entry.message.text,
                    );
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
