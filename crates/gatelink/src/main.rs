//! gatelink - gateway client command line
//!
//! Connects to a real-time gateway, logs inbound events and state changes, or sends
//! a single event.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gatelink::{ClientConfig, GatewayClient, GatewayError, SendOutcome, StaticToken};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "gatelink")]
#[command(about = "Resilient real-time gateway client")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Connection {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway URL (used when no config file is given)
    #[arg(long)]
    gateway: Option<String>,

    /// Credential passed in the handshake URL
    #[arg(long, env = "GATELINK_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and log events until Ctrl-C
    Listen {
        #[command(flatten)]
        connection: Connection,

        /// Event types to log (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,
    },

    /// Connect, send one event and disconnect
    Send {
        #[command(flatten)]
        connection: Connection,

        /// Event type
        #[arg(long)]
        event: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "gatelink.toml")]
        output: PathBuf,

        /// Gateway URL
        #[arg(long, default_value = "wss://localhost:8443/gateway")]
        gateway: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("gatelink=info".parse()?);
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    // Another component may already have installed a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Listen { connection, events } => listen(connection, events).await?,
        Commands::Send {
            connection,
            event,
            payload,
        } => send(connection, event, payload).await?,
        Commands::InitConfig { output, gateway } => init_config(output, gateway)?,
    }

    Ok(())
}

fn load_config(connection: &Connection) -> anyhow::Result<ClientConfig> {
    let config = match (&connection.config, &connection.gateway) {
        (Some(path), _) => ClientConfig::from_file(path)?,
        (None, Some(gateway)) => {
            let config = ClientConfig::new(gateway.clone());
            config.validate()?;
            config
        }
        (None, None) => anyhow::bail!("either --config or --gateway is required"),
    };
    Ok(config)
}

fn token_provider(connection: &Connection) -> StaticToken {
    connection
        .token
        .clone()
        .map_or_else(StaticToken::none, StaticToken::new)
}

async fn listen(connection: Connection, events: Vec<String>) -> anyhow::Result<()> {
    let config = load_config(&connection)?;
    info!(gateway = %config.gateway_url, "starting gatelink listener");

    let client = GatewayClient::spawn(config, token_provider(&connection))?;

    let subscription = client.on_connection_state_change(|state| {
        info!(
            phase = %state.phase,
            attempts = state.reconnect_attempts,
            connection_id = state.connection_id.as_deref().unwrap_or("-"),
            last_error = state.last_error.as_ref().map_or("-", |e| e.message.as_str()),
            "connection state"
        );
    });

    for event_type in events {
        client.on(event_type, |frame| {
            info!(
                event_type = %frame.event_type,
                server_timestamp = ?frame.server_timestamp,
                payload = %frame.payload,
                "event"
            );
            Ok(())
        });
    }

    match client.connect().await {
        Ok(()) => {}
        Err(GatewayError::CredentialUnavailable) => {
            anyhow::bail!("no credential: pass --token or set GATELINK_TOKEN")
        }
        Err(e) => warn!(error = %e, "initial connection failed; retrying in the background"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let metrics = client.connection_metrics();
    info!(
        sent = metrics.messages_sent,
        received = metrics.frames_received,
        rejected = metrics.frames_rejected,
        quality = %metrics.quality_score,
        "shutting down"
    );
    subscription.unsubscribe();
    client.shutdown().await;
    Ok(())
}

async fn send(connection: Connection, event: String, payload: String) -> anyhow::Result<()> {
    let config = load_config(&connection)?;
    let payload: serde_json::Value =
        serde_json::from_str(&payload).context("payload must be valid JSON")?;

    let client = GatewayClient::spawn(config, token_provider(&connection))?;
    client.connect().await?;

    let outcome = client.send_message(&event, &payload).await?;
    info!(event_type = %event, ?outcome, "event submitted");

    if outcome == SendOutcome::Queued {
        // The link dropped mid-send; wait for a reconnect to flush it.
        let mut metrics = client.subscribe_metrics();
        tokio::time::timeout(DRAIN_TIMEOUT, metrics.wait_for(|m| m.queue_depth == 0))
            .await
            .context("queued event was not delivered before the drain timeout")?
            .context("client stopped before the queue drained")?;
    }

    client.disconnect(true).await;
    client.shutdown().await;
    Ok(())
}

fn init_config(output: PathBuf, gateway: String) -> anyhow::Result<()> {
    let config = ClientConfig::new(gateway);
    config.validate()?;
    let content = config.to_toml()?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to {}", output.display());
    Ok(())
}
