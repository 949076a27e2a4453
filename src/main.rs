//! Plugin Bridge Daemon
//!
//! Joins a relay channel and executes inbound commands with the built-in
//! diagnostic registry, or sends a single command and prints its result.
//!
//! ## Usage
//!
//! ```bash
//! # Join a random channel on the default relay
//! plugin-bridge
//!
//! # Join a known channel on another relay
//! plugin-bridge --server-url wss://relay.example.com/ws --channel team0001
//!
//! # Send one command and exit
//! plugin-bridge --channel team0001 --send echo --params '{"hello":"world"}'
//!
//! # Structured logs
//! RUST_LOG=plugin_bridge=debug plugin-bridge --json-logs
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use plugin_bridge::channel::ConnectionStatus;
use plugin_bridge::{ChannelClient, CommandRegistry, Config, ProgressHub};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plugin-bridge")]
#[command(about = "Reconnecting command channel between a plugin host and an automation server")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server WebSocket URL
    #[arg(long, env = "BRIDGE_SERVER_URL")]
    server_url: Option<String>,

    /// Channel to join (random when unset)
    #[arg(long, env = "BRIDGE_CHANNEL")]
    channel: Option<String>,

    /// Do not reconnect after the connection drops
    #[arg(long)]
    no_auto_reconnect: bool,

    /// Consecutive reconnect attempts before giving up
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Send this command once, print the result and exit
    #[arg(long)]
    send: Option<String>,

    /// JSON parameters for --send
    #[arg(long, default_value = "{}", requires = "send")]
    params: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("plugin_bridge=info".parse()?);
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(Config::default_path())?,
    };

    // Apply CLI overrides
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(channel) = args.channel {
        config.channel = Some(channel);
    }
    if args.no_auto_reconnect {
        config.auto_reconnect = false;
    }
    if let Some(max) = args.max_reconnect_attempts {
        config.max_reconnect_attempts = max;
    }
    config.validate()?;

    info!(
        server_url = %config.server_url,
        channel = ?config.channel,
        auto_reconnect = config.auto_reconnect,
        "Starting plugin-bridge"
    );

    let hub = Arc::new(ProgressHub::new(config.progress_hub_config()));
    tokio::spawn(log_progress(hub.subscribe()));

    let client = ChannelClient::builder(config.client_config())
        .progress_sink(hub.clone())
        .executor(Arc::new(CommandRegistry::with_builtins()))
        .spawn();
    tokio::spawn(log_status(client.subscribe()));

    match client.connect().await {
        Ok(channel) => info!(channel = %channel, "Channel ready"),
        Err(e) if config.auto_reconnect => {
            warn!(error = %e, "Initial connection failed, retrying in background")
        }
        Err(e) => {
            client.close().await;
            return Err(e).context("Failed to connect");
        }
    }

    if let Some(command) = args.send {
        let params: serde_json::Value =
            serde_json::from_str(&args.params).context("--params must be valid JSON")?;
        let outcome = send_once(&client, &command, params).await;
        client.close().await;
        let result = outcome?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    client.close().await;
    Ok(())
}

/// Wait until joined (or given up), then send `command`.
async fn send_once(
    client: &ChannelClient,
    command: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let mut status = client.subscribe();
    let wait = status.wait_for(|snapshot| {
        matches!(
            snapshot.status,
            ConnectionStatus::Connected { .. } | ConnectionStatus::Failed { .. }
        )
    });
    let joined = match tokio::time::timeout(Duration::from_secs(60), wait).await {
        Ok(Ok(snapshot)) => snapshot.status.is_connected(),
        Ok(Err(_)) | Err(_) => false,
    };
    if !joined {
        bail!("Could not join a channel on {}", client.config().server_url);
    }

    Ok(client.send(command, params).await?)
}

async fn log_progress(mut rx: broadcast::Receiver<plugin_bridge::ProgressEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => info!(
                command_id = %event.command_id,
                command_type = %event.command_type,
                status = ?event.status,
                progress = event.progress,
                message = %event.message,
                "Progress"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Progress log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_status(mut rx: tokio::sync::watch::Receiver<plugin_bridge::ConnectionSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        match &snapshot.status {
            ConnectionStatus::Failed { attempts } => error!(
                attempts = attempts,
                last_error = ?snapshot.last_error,
                "Connection failed; restart or reconnect manually"
            ),
            status => info!(status = ?status, attempts = snapshot.reconnect_attempts, "Connection status"),
        }
    }
}
