//! Remediation Engine Admin CLI
//!
//! Operational tooling against the engine's Postgres database: inspect jobs,
//! reset tripped circuit breakers, rerun jobs and trigger a retention sweep.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};

use remediation_engine::engine::postgres::PgStore;
use remediation_engine::security::vault_from_config;
use remediation_engine::{
    EngineConfig, HttpActionExecutor, RemediationStore, RetentionSweeper, RunOutcome, WorkflowRunner,
};

#[derive(Parser)]
#[command(name = "remediation-admin")]
#[command(about = "Remediation Engine Admin CLI - circuit, job and retention maintenance")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "REMEDIATION_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show row counts and open circuits
    Stats,

    /// Close a tripped circuit breaker
    ResetCircuit {
        /// Integration ID
        integration_id: i64,

        /// Confirm the reset
        #[arg(long)]
        confirm: bool,
    },

    /// Run a job's workflow again with its stored trigger context
    RerunJob {
        /// Tenant owning the job
        #[arg(long)]
        tenant_id: i64,

        /// Job ID to rerun
        job_id: i64,
    },

    /// List a tenant's jobs
    ListJobs {
        /// Tenant ID
        #[arg(long)]
        tenant_id: i64,
    },

    /// Print the log lines of one job
    JobLogs {
        /// Job ID
        job_id: i64,
    },

    /// Purge jobs older than the data_retention_days setting
    Sweep {
        /// Confirm the purge
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = EngineConfig::load(cli.config.as_deref())?;
    let vault = vault_from_config(&config.vault)?;
    let pg = Arc::new(PgStore::connect(&config.database, vault).await?);
    pg.migrate().await?;

    match cli.command {
        Commands::Stats => show_stats(&pg).await?,

        Commands::ResetCircuit {
            integration_id,
            confirm,
        } => {
            if !confirm {
                error!("❌ Circuit reset requires --confirm flag for safety");
                return Ok(());
            }
            let before = pg.circuit_state(integration_id).await?;
            pg.reset_circuit(integration_id).await?;
            info!(
                "✅ Circuit for integration {} reset (was {} failure(s), available: {})",
                integration_id, before.consecutive_failures, before.is_available
            );
        }

        Commands::RerunJob { tenant_id, job_id } => {
            let store: Arc<dyn RemediationStore> = pg.clone();
            let executor = Arc::new(HttpActionExecutor::new(store.clone(), config.executor.clone())?);
            let runner = WorkflowRunner::new(store, executor);

            match runner.rerun_job(tenant_id, job_id).await? {
                RunOutcome::Completed { job_id: new_job } => info!("✅ Rerun completed as job {}", new_job),
                RunOutcome::Failed { job_id: new_job } => {
                    warn!("Rerun failed as job {}; see `job-logs {}`", new_job, new_job)
                }
                RunOutcome::Duplicate => bail!("job {} could not be rerun: duplicate", job_id),
            }
        }

        Commands::ListJobs { tenant_id } => list_jobs(&pg, tenant_id).await?,

        Commands::JobLogs { job_id } => {
            let logs = pg.job_logs(job_id).await?;
            println!("\n📜 Job {} ({} line(s))", job_id, logs.len());
            println!("=====================================");
            for log in logs {
                println!(
                    "{} [{}] {}{}",
                    log.created_at.format("%Y-%m-%d %H:%M:%S"),
                    log.level.as_str(),
                    log.step_name.map(|s| format!("<{}> ", s)).unwrap_or_default(),
                    log.message
                );
            }
        }

        Commands::Sweep { confirm } => {
            if !confirm {
                error!("❌ Sweep operation requires --confirm flag for safety");
                return Ok(());
            }
            let store: Arc<dyn RemediationStore> = pg.clone();
            match RetentionSweeper::new(store).sweep().await? {
                Some(stats) => info!("✅ Removed {} job(s) and {} log line(s)", stats.jobs, stats.logs),
                None => warn!("Retention is disabled (data_retention_days unset or not positive)"),
            }
        }
    }

    Ok(())
}

async fn show_stats(pg: &PgStore) -> Result<()> {
    info!("📊 Gathering remediation statistics...");
    let stats = pg.stats().await?;

    println!("\n📈 Remediation Engine Statistics");
    println!("==================================");
    println!("Tenants:          {}", stats.tenants);
    println!("Integrations:     {}", stats.integrations);
    println!("Open circuits:    {}", stats.open_circuits);
    println!("Workflows:        {}", stats.workflows);
    println!("Jobs running:     {}", stats.running_jobs);
    println!("Jobs completed:   {}", stats.completed_jobs);
    println!("Jobs failed:      {}", stats.failed_jobs);
    println!("Processed events: {}", stats.processed_events);
    Ok(())
}

async fn list_jobs(pg: &PgStore, tenant_id: i64) -> Result<()> {
    let jobs = pg.list_jobs(tenant_id).await?;

    println!("\n📋 Jobs for tenant {} ({})", tenant_id, jobs.len());
    println!("=====================================");
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "🔧 {:>6}  workflow {:>4}  {:<9}  issue {}  ({})",
            job.id,
            job.workflow_id,
            job.status.as_str(),
            job.issue_id,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
