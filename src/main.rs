//! Flotilla CLI — boot the orchestrator or mint operator secrets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flotilla_runtime::{
    hash_password, Catalog, CronScheduler, JobRunner, JobStatus, KeyVault, RunRequest,
    RuntimeConfig, SchedulerConfig, SshExecutor,
};

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Multi-host remote command orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until interrupted.
    Serve {
        /// Catalog database path (overrides FLOTILLA_DB).
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Run a template once across hosts and groups, then print the logs.
    Run {
        /// Template id to execute.
        #[arg(long)]
        template: i64,
        /// Credential id to authenticate with.
        #[arg(long)]
        credential: i64,
        /// Host ids to target (repeatable).
        #[arg(long = "host")]
        hosts: Vec<i64>,
        /// Group ids to target (repeatable).
        #[arg(long = "group")]
        groups: Vec<i64>,
        /// Catalog database path (overrides FLOTILLA_DB).
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Generate a fresh encryption key for FLOTILLA_SECRET_KEY.
    Keygen,
    /// Hash a password for a local user row.
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            println!("{}", KeyVault::generate_key());
            Ok(())
        }
        Commands::HashPassword { password } => {
            println!("{}", hash_password(&password)?);
            Ok(())
        }
        Commands::Serve { db } => serve(db).await,
        Commands::Run {
            template,
            credential,
            hosts,
            groups,
            db,
        } => {
            run_once(
                db,
                RunRequest {
                    template_id: template,
                    credential_id: credential,
                    host_ids: hosts,
                    group_ids: groups,
                },
            )
            .await
        }
    }
}

fn open_catalog(config: &RuntimeConfig, db: Option<PathBuf>) -> Result<Arc<Catalog>> {
    let path = db.unwrap_or_else(|| config.catalog_path.clone());
    let vault = KeyVault::new(&config.secret_key)?;
    let catalog = Catalog::open(&path, vault)
        .with_context(|| format!("opening catalog at {}", path.display()))?;
    tracing::info!(path = %path.display(), "catalog open");
    Ok(Arc::new(catalog))
}

fn init_tracing(config: &RuntimeConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(db: Option<PathBuf>) -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    init_tracing(&config);
    config.warn_if_default_key();

    let catalog = open_catalog(&config, db)?;
    let executor = Arc::new(SshExecutor::new(catalog.clone()));
    let scheduler = CronScheduler::new(catalog, executor, SchedulerConfig::default());
    scheduler.start().await?;

    tracing::info!("flotilla is up; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    scheduler.shutdown().await;
    Ok(())
}

async fn run_once(db: Option<PathBuf>, request: RunRequest) -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    init_tracing(&config);
    config.warn_if_default_key();

    let catalog = open_catalog(&config, db)?;
    let executor = Arc::new(SshExecutor::new(catalog.clone()));
    let runner = JobRunner::new(catalog.clone(), executor);

    let job_id = runner.run(request).await?;
    let job = loop {
        let job = catalog
            .get_adhoc_job(job_id)
            .await?
            .context("job row vanished")?;
        if job.status != JobStatus::Running {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    println!("job {} ({}): {}", job.id, job.template_name, job.status);
    for log in catalog.adhoc_job_logs(job_id).await? {
        println!("--- {} [{}]", log.hostname, log.status);
        if !log.stdout.is_empty() {
            println!("{}", log.stdout.trim_end());
        }
        if !log.stderr.is_empty() {
            eprintln!("{}", log.stderr.trim_end());
        }
    }
    std::process::exit(if job.status == JobStatus::Completed { 0 } else { 1 });
}
