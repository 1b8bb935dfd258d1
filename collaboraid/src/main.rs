//! `collaboraid`: terminal client for `CollaborAid` messaging.
//!
//! Chats with one peer or lists conversations. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/collaboraid/config.toml`).
//!
//! ```bash
//! COLLABORAID_TOKEN=... cargo run --bin collaboraid -- --user-id 1 chat --peer 42
//! COLLABORAID_TOKEN=... cargo run --bin collaboraid -- --user-id 1 inbox
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;

use collaboraid::api::RestClient;
use collaboraid::chat::conversation::{ConversationState, ConversationView};
use collaboraid::chat::inbox::{Inbox, InboxView};
use collaboraid::chat::queue::OutboundQueue;
use collaboraid::config::{CliArgs, CliCommand, ClientConfig};
use collaboraid::connection::ConnectionManager;
use collaboraid::repository::MessageRepository;
use collaboraid::transport::stomp::StompConnector;
use collaboraid_proto::message::{Message, SendStatus, TempId, Timestamp, UserId};

type Repo = MessageRepository<StompConnector, RestClient>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout carries the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let session = match config.to_session() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("error: {e} (set --user-id and COLLABORAID_TOKEN)");
            return ExitCode::from(2);
        }
    };
    tracing::info!(user_id = %session.user_id(), "collaboraid starting");

    let history = match RestClient::new(&config.api_url, Arc::clone(&session), config.request_timeout) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let connector = StompConnector::new(&config.ws_url, config.connect_timeout, config.heart_beat);
    let connection = ConnectionManager::new(
        connector,
        session,
        config.reconnect_delay,
        config.event_buffer,
    );
    let repo = MessageRepository::new(connection, history);

    match cli.command.unwrap_or(CliCommand::Inbox) {
        CliCommand::Chat { peer } => run_chat(repo, UserId::new(peer), &config).await,
        CliCommand::Inbox => run_inbox(repo, &config).await,
    }

    tracing::info!("collaboraid exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("collaboraid.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// One conversation on stdin/stdout until `/quit`, EOF or Ctrl-C.
async fn run_chat(repo: Repo, peer: UserId, config: &ClientConfig) {
    let state = ConversationState::new(
        repo,
        peer,
        None,
        Arc::new(OutboundQueue::new(config.queue)),
    );
    let printer = tokio::spawn(print_conversation(
        state.subscribe(),
        config.timestamp_format.clone(),
    ));
    state.start();
    state.load_conversation().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        };
        let input = line.trim();
        match input {
            "" => {}
            "/quit" => break,
            "/reload" => state.load_conversation().await,
            _ if input.starts_with("/retry") => {
                let arg = input.trim_start_matches("/retry").trim();
                match arg.parse::<TempId>() {
                    Ok(temp_id) => {
                        if !state.retry_message(&temp_id).await {
                            println!("! retry of {temp_id} did not go through");
                        }
                    }
                    Err(_) => println!("! usage: /retry <tempId>"),
                }
            }
            _ => {
                state.send_message(input).await;
            }
        }
    }

    state.close().await;
    printer.abort();
}

/// Prints new messages, status changes, banners and connectivity.
async fn print_conversation(mut rx: watch::Receiver<ConversationView>, fmt: String) {
    let mut shown: Vec<(Option<TempId>, SendStatus)> = Vec::new();
    let mut connected = None;
    let mut error: Option<String> = None;
    loop {
        let view = rx.borrow_and_update().clone();
        if connected != Some(view.connected) {
            connected = Some(view.connected);
            println!(
                "-- {} --",
                if view.connected { "connected" } else { "offline" }
            );
        }
        if view.error != error {
            if let Some(e) = &view.error {
                println!("! {e}");
            }
            error.clone_from(&view.error);
        }
        if view.messages.len() < shown.len() {
            shown.clear();
        }
        for (i, message) in view.messages.iter().enumerate() {
            match shown.get_mut(i) {
                Some(entry) if entry.1 != message.send_status => {
                    entry.1 = message.send_status;
                    if let Some(temp_id) = message.temp_id {
                        println!("   [{temp_id}] {}", message.send_status);
                    }
                }
                Some(_) => {}
                None => {
                    println!("{}", render_message(message, &view, &fmt));
                    shown.push((message.temp_id, message.send_status));
                }
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn render_message(message: &Message, view: &ConversationView, fmt: &str) -> String {
    let from_peer = message.sender_id == view.peer_id;
    let who = if from_peer {
        view.peer_name
            .clone()
            .unwrap_or_else(|| format!("user {}", view.peer_id))
    } else {
        "me".to_string()
    };
    let mut line = format!("[{}] {who}: {}", message.timestamp.format(fmt), message.content);
    if !from_peer && message.send_status != SendStatus::Sent {
        if let Some(temp_id) = message.temp_id {
            line.push_str(&format!("  ({} {temp_id})", message.send_status));
        }
    }
    line
}

/// Conversation previews, refreshed on every change until Ctrl-C.
async fn run_inbox(repo: Repo, config: &ClientConfig) {
    let inbox = Inbox::new(repo);
    let printer = tokio::spawn(print_inbox(inbox.subscribe(), config.timestamp_format.clone()));
    inbox.start();
    inbox.load_conversations().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(err = %e, "failed to wait for ctrl-c");
    }
    inbox.close().await;
    printer.abort();
}

async fn print_inbox(mut rx: watch::Receiver<InboxView>, fmt: String) {
    loop {
        let view = rx.borrow_and_update().clone();
        if !view.loading {
            println!(
                "== {} ({}, {} unread) ==",
                view.username,
                if view.connected { "online" } else { "offline" },
                view.unread_total()
            );
            if let Some(e) = &view.error {
                println!("! {e}");
            }
            let now = Timestamp::now();
            for preview in &view.previews {
                let unread = match preview.unread_count {
                    0 => String::new(),
                    n => format!("({n})"),
                };
                println!(
                    "{unread:>5} {:<20} {:>9} {}  {}",
                    preview.display_name(),
                    preview.relative_label(now),
                    preview.timestamp.format(&fmt),
                    preview.last_message
                );
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
