// chatbook-sync entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use chatbook_common::types::EntityId;
use chatbook_sync::auth::EnvTokenProvider;
use chatbook_sync::cache::{CacheSeed, MemoryCache, SyncCache};
use chatbook_sync::config::ClientConfig;
use chatbook_sync::connection::ConnectionMachine;
use chatbook_sync::runtime::{run_session, ReconnectPolicy, SessionCommand};
use chatbook_sync::session::{SessionNotice, SyncSession};

#[derive(Parser)]
#[command(name = "chatbook-sync", about = "Chatbook push-channel sync client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to a notebook and its conversation and log pushed updates
    Watch(WatchArgs),
}

#[derive(clap::Args)]
struct WatchArgs {
    /// Notebook (project) id
    #[arg(long)]
    notebook: i64,
    /// Bot conversation id
    #[arg(long)]
    conversation: i64,
    /// JSON snapshot used to pre-populate the cache
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Config file (defaults to ~/.chatbook/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured push channel URL
    #[arg(long)]
    ws_url: Option<String>,
    /// Override the configured organization
    #[arg(long)]
    organization: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Watch(args) => watch(args).await,
    }
}

async fn watch(args: WatchArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config `{}`", path.display()))?,
        None => ClientConfig::load(),
    };
    let ws_url = args
        .ws_url
        .or(config.ws_url.clone())
        .context("no ws_url configured; pass --ws-url or set it in config.toml")?;
    let organization_id = args
        .organization
        .or(config.organization_id)
        .context("no organization configured; pass --organization or set it in config.toml")?;

    let mut cache = MemoryCache::new();
    if let Some(path) = &args.seed {
        cache.seed(CacheSeed::load_from(path)?)?;
    }

    let machine = ConnectionMachine::new(Uuid::new_v4(), config.auth_retry_delay());
    info!(tab_id = %machine.tab_id(), %ws_url, organization_id, "starting push channel session");
    let session = SyncSession::new(machine, cache, organization_id);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();

    commands_tx
        .send(SessionCommand::Subscribe {
            notebook_id: EntityId::Persisted(args.notebook),
            conversation_id: EntityId::Persisted(args.conversation),
        })
        .context("session command channel closed")?;

    let shutdown_tx = commands_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(SessionCommand::Shutdown);
        }
    });

    tokio::spawn(async move {
        while let Some(notice) = notices_rx.recv().await {
            match notice {
                SessionNotice::PatchApplied { target, outcome } => {
                    info!(notebook_id = %target.notebook_id, ?outcome, "patch applied");
                }
                SessionNotice::SubscriptionFailed { channel, id, status } => {
                    warn!(?channel, id, ?status, "subscription failed; refresh required");
                }
                SessionNotice::CacheDesynchronized { target, error } => {
                    warn!(notebook_id = %target.notebook_id, %error, "cache out of sync; re-fetch required");
                }
            }
        }
    });

    let session = run_session(
        &ws_url,
        ReconnectPolicy::from(&config.reconnect),
        session,
        Arc::new(EnvTokenProvider::new(config.token_env_var.clone())),
        commands_rx,
        notices_tx,
    )
    .await
    .context("push channel session terminated unexpectedly")?;

    let messages = session
        .cache()
        .message_pages(EntityId::Persisted(args.conversation))
        .map(|pages| pages.len())
        .unwrap_or(0);
    info!(messages, "session ended");
    Ok(())
}
