use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeepsync_core::parse_level;
use zeepsync_sync::{Supervisor, SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "zeepsync")]
#[command(about = "Keeps the level catalog in sync with the Zeepkist Steam Workshop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run sync cycles until interrupted.
    Run,
    /// Run a single cycle and print its statistics as JSON.
    Once,
    /// Parse a level file and print what the sync would record for it.
    Inspect { file: PathBuf },
    /// Validate the environment configuration.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ZEEPSYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, finishing current step"),
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
        trigger.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = SyncConfig::from_env();
            let engine = SyncEngine::from_config(&config)?;
            let mut supervisor =
                Supervisor::new(engine, config.backoff_base(), config.cycle_delay());
            supervisor.run_until_cancelled(&shutdown_token()).await;
        }
        Commands::Once => {
            let config = SyncConfig::from_env();
            let engine = SyncEngine::from_config(&config)?;
            let stats = engine.run_cycle(&shutdown_token()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Inspect { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let level = parse_level(&String::from_utf8_lossy(&bytes))
                .with_context(|| format!("parsing {}", file.display()))?;
            let summary = json!({
                "file": file.display().to_string(),
                "uid": level.uid,
                "author": level.author,
                "metrics": level.metrics,
                "skybox": level.skybox,
                "ground": level.ground,
                "fingerprint": level.fingerprint,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckConfig => {
            let config = SyncConfig::from_env();
            config.validate()?;
            println!("configuration ok: {config:#?}");
        }
    }

    Ok(())
}
