//! sync-bridge - bidirectional sync between a wide-column store and a document index
//!
//! ```text
//! sync-bridge <config.yaml> [sync_forever|sync_once|reset] [-v...]
//! ```
//!
//! Exit codes: `0` success, `1` a pipeline or store failed, `2` invalid configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sync_bridge::{checkpoint, storage, SyncConfig, SyncOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Action {
    /// Run passes every `interval` seconds until SIGINT/SIGTERM
    SyncForever,
    /// Run one pass of every pipeline and exit
    SyncOnce,
    /// Delete all checkpoints so the next pass is a full sync
    Reset,
}

/// Keeps a Cassandra table and an Elasticsearch index in sync, both ways.
#[derive(Debug, Parser)]
#[command(name = "sync-bridge", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration
    config: PathBuf,

    #[arg(value_enum, default_value_t = Action::SyncForever)]
    action: Action,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, finishing current batch"),
        _ = terminate => info!("Received SIGTERM, finishing current batch"),
    }
    token.cancel();
}

async fn run(cli: Cli, config: SyncConfig) -> Result<ExitCode> {
    let checkpoints = checkpoint::open(&config.checkpoint.url)
        .await
        .context("opening checkpoint store")?;

    if cli.action == Action::Reset {
        checkpoints.clear().await.context("clearing checkpoints")?;
        info!(url = %config.checkpoint.url, "Checkpoints reset; next pass will be a full sync");
        return Ok(ExitCode::SUCCESS);
    }

    let store_a = storage::connect_a(&config).await.context("connecting to store A")?;
    let store_b = storage::connect_b(&config).await.context("connecting to store B")?;
    let orchestrator = SyncOrchestrator::new(config, store_a, store_b, checkpoints)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match cli.action {
        Action::SyncOnce => {
            let summary = orchestrator.sync_once(&cancel).await;
            for (pipeline, e) in &summary.failures {
                error!(%pipeline, error = %e, "Pipeline failed");
            }
            Ok(ExitCode::from(summary.exit_code() as u8))
        }
        Action::SyncForever => {
            orchestrator.sync_forever(&cancel).await;
            Ok(ExitCode::SUCCESS)
        }
        Action::Reset => Ok(ExitCode::SUCCESS),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match SyncConfig::load(&cli.config).and_then(|c| storage::check_adapters(&c).map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };
    info!(
        config = %cli.config.display(),
        action = ?cli.action,
        workers = config.workers,
        cluster_shards = config.cluster_shards,
        "Starting sync-bridge"
    );

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "sync-bridge failed");
            ExitCode::FAILURE
        }
    }
}
