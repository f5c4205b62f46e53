//! Convo Sync CLI - chat in one conversation from a terminal.
//!
//! This is the main binary entry point. See the `convo_sync` library for
//! the core functionality.

use anyhow::Result;
use clap::{Parser, Subcommand};
use convo_sync::{ChatClient, ChatError, Config, ConversationStore, StoreChange};
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "convo-sync")]
#[command(version)]
#[command(about = "Live conversation sync client")]
struct Cli {
    /// Override the configured server URL
    #[arg(long, global = true)]
    server_url: Option<String>,
    /// Override the configured sender id
    #[arg(long, global = true)]
    sender_id: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a conversation and send each stdin line as a message
    Chat {
        /// Conversation to join
        #[arg(long)]
        conversation: String,
    },
    /// Print the effective configuration (token redacted)
    Config,
}

fn print_config(config: &Config) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    if let Some(map) = value.as_object_mut() {
        let token = if config.has_token() { "<redacted>" } else { "<unset>" };
        map.insert("token".to_string(), serde_json::Value::from(token));
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print store updates for `conversation_id` as they happen.
async fn print_changes(
    store: ConversationStore,
    conversation_id: String,
    mut changes: broadcast::Receiver<StoreChange>,
) {
    loop {
        match changes.recv().await {
            Ok(StoreChange::Appended {
                conversation_id: conv,
                id,
            }) if conv == conversation_id => {
                if let Some(msg) = store.get(&conv).into_iter().find(|m| m.id == id) {
                    let tag = if msg.is_agent { " (agent)" } else { "" };
                    println!(
                        "[{}] {}{}: {}",
                        msg.timestamp.format("%H:%M:%S"),
                        msg.sender_id,
                        tag,
                        msg.content
                    );
                }
            }
            Ok(StoreChange::Reconciled { id, .. }) => log::debug!("[Chat] Delivered as {}", id),
            Ok(StoreChange::Failed {
                client_message_id, ..
            }) => eprintln!("! message {} was not delivered", client_message_id),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("[Chat] Display lagged, skipped {} updates", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_chat(config: Config, conversation_id: String) -> Result<()> {
    let mut client = ChatClient::with_websocket(&config);
    let printer = tokio::spawn(print_changes(
        client.store().clone(),
        conversation_id.clone(),
        client.store().changes(),
    ));

    client
        .session()
        .set_active_conversation(Some(conversation_id.clone()));
    client.connect()?;
    println!("Joined {} as {}. Type a message and press enter.", conversation_id, config.sender_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match client.session().send_chat_message(text) {
                    Ok(_pending) => {}
                    Err(ChatError::NotConnected) => {
                        eprintln!("! not connected ({:?}), message not sent", client.state());
                    }
                    Err(e) => eprintln!("! {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down...");
    client.shutdown().await;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }
    if let Some(sender_id) = cli.sender_id {
        config.sender_id = sender_id;
    }

    match cli.command {
        Commands::Chat { conversation } => run_chat(config, conversation).await?,
        Commands::Config => print_config(&config)?,
    }

    Ok(())
}
