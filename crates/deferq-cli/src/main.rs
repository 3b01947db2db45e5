//! deferq - command-line front end for the deferred task queue.
//!
//! A cron entry running `deferq process` (or a long-lived `deferq run`) is
//! what turns enqueued rows into executed tasks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use deferq_core::{Config, Driver, Scheduler, TaskId, impls};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod handlers;

/// Durable deferred execution backed by SQLite or PostgreSQL
#[derive(Parser)]
#[command(name = "deferq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ./deferq.toml when present)
    #[arg(long, env = "DEFERQ_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the task table if it does not exist
    SetupTables,

    /// Schedule a call to a registered handler
    Enqueue {
        /// Human-readable label stored with the task
        #[arg(long)]
        name: String,

        /// Registered handler name, e.g. demo.add.v1
        #[arg(long)]
        handler: String,

        /// When to run (RFC 3339). Defaults to now.
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<DateTime<Utc>>,

        /// Run this many seconds from now
        #[arg(long)]
        in_secs: Option<i64>,

        /// Captured values, as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,

        /// Argument defaults, as a JSON object
        #[arg(long, default_value = "{}")]
        defaults: String,
    },

    /// Run every task that is due, once
    Process,

    /// Keep processing due tasks until Ctrl-C
    Run,

    /// Count tasks per status
    Status,

    /// Print one task as JSON
    Show {
        /// Task id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // DATABASE_URL and DEFERQ_* may come from a local .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("deferq=debug,deferq_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("deferq=info,deferq_core=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let scheduler = build_scheduler(&config).await?;

    match cli.command {
        Commands::SetupTables => {
            scheduler.bootstrap().await?;
            println!("tables ready");
        }
        Commands::Enqueue {
            name,
            handler,
            at,
            in_secs,
            context,
            defaults,
        } => {
            let scheduled_time = match (at, in_secs) {
                (Some(at), _) => at,
                (None, Some(secs)) => offset_from(scheduler.now(), secs)?,
                (None, None) => scheduler.now(),
            };
            let context = parse_object("--context", &context)?;
            let defaults = parse_object("--defaults", &defaults)?;
            let id = scheduler
                .enqueue(&name, scheduled_time, &handler, &context, &defaults)
                .await?;
            println!("{}", id.get());
        }
        Commands::Process => {
            let report = scheduler.process_due().await?;
            println!(
                "claimed={} succeeded={} failed={}",
                report.claimed, report.succeeded, report.failed
            );
        }
        Commands::Run => {
            scheduler.bootstrap().await?;
            let interval = config.worker.poll_interval();
            let driver = Driver::spawn(Arc::new(scheduler), interval);
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            driver.shutdown_and_join().await;
        }
        Commands::Status => {
            println!("{}", scheduler.counts().await?);
        }
        Commands::Show { id } => {
            let Some(record) = scheduler.task(TaskId::new(id)).await? else {
                bail!("task {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

async fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let store = impls::connect(&config.database)
        .await
        .context("opening database")?;
    let scheduler = handlers::register_builtins(Scheduler::builder())?
        .store(store)
        .config(config.worker.clone())
        .build()?;
    Ok(scheduler)
}

fn offset_from(now: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>> {
    let Some(offset) = Duration::try_seconds(secs) else {
        bail!("--in-secs {secs} is out of range");
    };
    match now.checked_add_signed(offset) {
        Some(at) => Ok(at),
        None => bail!("--in-secs {secs} lands outside the supported date range"),
    }
}

fn parse_object(flag: &str, raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))?;
    if !value.is_object() {
        bail!("{flag} must be a JSON object");
    }
    Ok(value)
}
