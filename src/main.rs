use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use prompt_stream::cli::{Args, TransportKind};
use prompt_stream::config::ClientConfig;
use prompt_stream::latency::LatencyStats;
use prompt_stream::manager::{ConnectionManager, ManagerOptions};
use prompt_stream::model::{Role, SessionStatus};
use prompt_stream::store::{ConnectionState, ConnectionStatus, StateStore, StoreEvent};
use prompt_stream::transport::{SseTransport, Transport, WebSocketTransport};
use prompt_stream::StreamError;

// ---------------------------------------------------------------------------
// Turn rendering
// ---------------------------------------------------------------------------

/// Tracks how much of each assistant message has already been printed so
/// that repeated `MessageUpdated` events only emit the new suffix.
#[derive(Debug, Default)]
struct TurnPrinter {
    printed: HashMap<String, usize>,
}

impl TurnPrinter {
    /// Text not yet shown for `message_id`, plus any error attached to it.
    fn delta(&mut self, store: &StateStore, session_id: &str, message_id: &str) -> Option<(String, Option<String>)> {
        let session = store.session(session_id)?;
        let message = session.message(message_id)?;
        if message.role == Role::User {
            return None;
        }
        let shown = self.printed.entry(message_id.to_string()).or_insert(0);
        let fresh = message.content.get(*shown..).unwrap_or_default().to_string();
        *shown = message.content.len();
        let error = if message.partial { None } else { message.error.clone() };
        Some((fresh, error))
    }
}

fn format_latency(stats: &LatencyStats) -> String {
    let ms = |v: Option<f64>| v.map(|v| format!("{v:.0}ms")).unwrap_or_else(|| "-".to_string());
    format!(
        "latency: last {} | p50 {} | p95 {} | n={}",
        ms(stats.last_ms),
        ms(stats.p50_ms),
        ms(stats.p95_ms),
        stats.count
    )
}

fn offline_error(session_id: String, status: ConnectionStatus) -> StreamError {
    StreamError::Offline {
        session_id,
        reason: status.last_error.unwrap_or_else(|| "offline".to_string()),
    }
}

/// Send one prompt and print the reply as it streams in.
async fn run_turn(
    mgr: &ConnectionManager,
    events: &mut broadcast::Receiver<StoreEvent>,
    prompt: &str,
    show_latency: bool,
) -> Result<(), StreamError> {
    let session_id = mgr.session_id().to_string();
    let mut printer = TurnPrinter::default();
    mgr.send_chat_message(prompt).await?;

    let mut stdout = io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "event receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Err(StreamError::ManagerStopped),
        };
        match event {
            StoreEvent::MessageUpdated { session_id: sid, message_id } if sid == session_id => {
                if let Some((text, error)) = printer.delta(mgr.store(), &sid, &message_id) {
                    print!("{text}");
                    stdout.flush()?;
                    if let Some(error) = error {
                        eprintln!("\n{} {}", "error:".red().bold(), error);
                    }
                }
            }
            StoreEvent::SessionStatus { session_id: sid, status } if sid == session_id => {
                if matches!(status, SessionStatus::Completed | SessionStatus::Error) {
                    break;
                }
            }
            StoreEvent::ServerError { session_id: sid, message } if sid == session_id => {
                eprintln!("{} {}", "server:".red().bold(), message);
            }
            StoreEvent::Connection(status) => match status.state {
                ConnectionState::Reconnecting => eprintln!(
                    "{}",
                    format!("[reconnecting, attempt {}]", status.reconnect_attempts).yellow()
                ),
                ConnectionState::Offline => {
                    return Err(offline_error(session_id, status));
                }
                _ => {}
            },
            StoreEvent::Notice { kind, data, .. } => {
                eprintln!("{} {}", format!("[{kind}]").cyan(), data);
            }
            _ => {}
        }
    }
    println!();

    if show_latency {
        let stats = mgr.latency().await?;
        eprintln!("{}", format_latency(&stats).dimmed());
    }
    Ok(())
}

fn build_transport(kind: TransportKind, config: &ClientConfig, session_id: &str) -> Result<Arc<dyn Transport>, StreamError> {
    Ok(match kind {
        TransportKind::Ws => Arc::new(WebSocketTransport::for_session(config, session_id)?),
        TransportKind::Sse => Arc::new(SseTransport::new(config, session_id)?),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "prompt-stream", &mut io::stdout());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let config = args.resolve_config()?;
    let session_id = args.session_id();
    let transport = build_transport(args.transport, &config, &session_id)?;
    info!(session_id = %session_id, transport = %args.transport, "starting session");

    let store = StateStore::new();
    let mut events = store.subscribe();
    let mgr = ConnectionManager::spawn(session_id, transport, store, ManagerOptions::from(&config));
    mgr.connect()?;

    match &args.prompt {
        Some(prompt) => run_turn(&mgr, &mut events, prompt, args.latency).await?,
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let prompt = line.trim();
                if prompt.is_empty() {
                    continue;
                }
                run_turn(&mgr, &mut events, prompt, args.latency).await?;
            }
        }
    }

    mgr.shutdown()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
