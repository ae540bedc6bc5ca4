// Remediation Engine - scheduler daemon
// Run with: cargo run --bin engine -- --config remediation.toml

//! # Remediation Engine Binary
//!
//! Starts the polling scheduler against Postgres and runs until Ctrl-C.
//!
//! ```text
//! main()
//!   ↓ loads
//! EngineConfig (file + REMEDIATION__* env)
//!   ↓ connects
//! PgStore (credential vault hooks)
//!   ↓ wires
//! HttpActionExecutor → WorkflowRunner → PollExecutor → Scheduler
//!   ↓ runs until
//! Ctrl-C (CancellationToken)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use remediation_engine::engine::postgres::PgStore;
use remediation_engine::security::vault_from_config;
use remediation_engine::{
    DetectorConnector, EngineConfig, HttpActionExecutor, PollExecutor, RemediationStore, RetentionSweeper,
    Scheduler, WorkflowRunner,
};

#[derive(Parser)]
#[command(name = "remediation-engine")]
#[command(about = "Polls issue detectors and runs remediation workflows")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "REMEDIATION_CONFIG")]
    config: Option<String>,

    /// Run poll tasks inline on the scheduler tick
    #[arg(long)]
    synchronous: bool,

    /// Log rendered (redacted) action payloads
    #[arg(long)]
    debug_payloads: bool,
}

/// Install the fmt subscriber; `RUST_LOG` wins over the configured level.
fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    config.scheduler.synchronous |= cli.synchronous;
    config.executor.debug_payloads |= cli.debug_payloads;

    init_tracing(config.log_level.as_deref());
    info!("Starting remediation engine");

    let vault = vault_from_config(&config.vault).context("initializing credential vault")?;
    let pg = PgStore::connect(&config.database, vault)
        .await
        .context("connecting to Postgres")?;
    pg.migrate().await.context("applying schema")?;
    let store: Arc<dyn RemediationStore> = Arc::new(pg);

    let executor = Arc::new(HttpActionExecutor::new(store.clone(), config.executor.clone())?);
    let sources = Arc::new(DetectorConnector::new(config.executor.http_timeout())?);
    let runner = Arc::new(WorkflowRunner::new(store.clone(), executor));
    let poller = Arc::new(PollExecutor::new(store.clone(), sources, runner));
    let sweeper = Arc::new(RetentionSweeper::new(store.clone()));
    let scheduler = Arc::new(Scheduler::new(store, poller, sweeper, config.scheduler.clone()));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    scheduler.run(shutdown).await?;
    info!("Remediation engine stopped");
    Ok(())
}
