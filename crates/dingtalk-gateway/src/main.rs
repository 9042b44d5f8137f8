//! `dingtalk-gateway` subprocess.
//!
//! Reads DingTalk stream frames as JSON Lines on stdin, writes one
//! `GatewayEvent` per unique message to stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dingtalk_gateway::transport::StdinConnector;
use dingtalk_gateway::{ConnectionSupervisor, GatewayConfig, JsonLinesForwarder};
use dingtalk_gateway_protocol::GatewayEvent;

#[derive(Parser)]
#[command(name = "dingtalk-gateway")]
#[command(about = "DingTalk stream gateway with duplicate suppression", long_about = None)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "dingtalk-gateway.yaml")]
    config: PathBuf,

    /// Account to connect
    #[arg(short, long, default_value = "default")]
    account: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("dingtalk_gateway={}", cli.log_level))),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let forwarder = Arc::new(JsonLinesForwarder::new(tokio::io::stdout()));
    let supervisor =
        ConnectionSupervisor::new(config, Arc::new(StdinConnector::new()), forwarder.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupt received, shutting down");
        on_signal.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, exiting without waiting for dispatches");
            std::process::exit(130);
        }
    });

    let completion = supervisor.start(&cli.account, &cancel)?;
    let result = completion.wait().await;

    let reason = match &result {
        Ok(reason) => reason.to_string(),
        Err(e) => e.to_string(),
    };
    if let Err(e) = forwarder
        .emit(&GatewayEvent::Disconnected {
            account_id: cli.account.clone(),
            reason,
        })
        .await
    {
        warn!(error = %e, "Failed to report disconnect");
    }

    let counts = supervisor.status().ingest;
    info!(
        received = counts.received,
        duplicates = counts.duplicates,
        malformed = counts.malformed,
        dropped = counts.dropped,
        dispatched = counts.dispatched,
        dispatch_failures = counts.dispatch_failures,
        "Gateway stopped"
    );

    result.context("stream connection failed")?;
    Ok(())
}
