use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtms_core::YearMonth;
use rtms_storage::BackupStore;
use rtms_sync::{CollectMode, CollectRequest, RunSummary, SyncConfig};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rtms-cli")]
#[command(about = "Capital-area apartment trade collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill whole years of trades, resuming from the checkpoint.
    Collect {
        #[arg(long, default_value_t = 2006)]
        start_year: i32,
        #[arg(long)]
        end_year: Option<i32>,
        /// Last month to collect, as YYYYMM.
        #[arg(long)]
        until: Option<YearMonth>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Progress file from an earlier collector to fold in first.
        #[arg(long)]
        merge_checkpoint: Option<PathBuf>,
    },
    /// Collect the previous and current month.
    Daily {
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Create or upgrade the store schema.
    Migrate,
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Download,
    Upload,
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Daily { concurrency: None }) {
        Commands::Collect {
            start_year,
            end_year,
            until,
            concurrency,
            merge_checkpoint,
        } => {
            let request = CollectRequest {
                mode: CollectMode::Backfill {
                    start_year,
                    end_year: end_year.unwrap_or_else(|| YearMonth::current().year()),
                    until,
                    merge_checkpoint,
                },
                concurrency,
            };
            let summary = rtms_sync::run_collection(&config, request, interrupted()).await?;
            print_summary("collect", &summary);
        }
        Commands::Daily { concurrency } => {
            let request = CollectRequest {
                mode: CollectMode::Daily,
                concurrency,
            };
            let summary = rtms_sync::run_collection(&config, request, interrupted()).await?;
            print_summary("daily", &summary);
        }
        Commands::Migrate => {
            let stats = rtms_sync::migrate(&config).await?;
            println!(
                "migrate complete: db={} properties={} transactions={} insights={}",
                config.db_path.display(),
                stats.properties,
                stats.transactions,
                stats.insights
            );
        }
        Commands::Backup(action) => {
            let bucket = rtms_sync::backup_store(&config).context("BACKUP_DIR is not set")?;
            let name = &config.backup_object_name;
            match action {
                BackupCommand::Download => match bucket.download(name, &config.db_path).await? {
                    Some(t) => println!(
                        "downloaded {} -> {} ({} bytes, sha256={})",
                        t.remote_name,
                        t.local_path.display(),
                        t.byte_size,
                        t.sha256
                    ),
                    None => println!("no backup named {name}"),
                },
                BackupCommand::Upload => {
                    let t = bucket.upload(&config.db_path, name).await?;
                    println!(
                        "uploaded {} -> {} ({} bytes, sha256={})",
                        t.local_path.display(),
                        t.remote_name,
                        t.byte_size,
                        t.sha256
                    );
                }
                BackupCommand::Info => match bucket.info(name).await? {
                    Some(o) => println!(
                        "{}: {} bytes, modified {}",
                        o.remote_name, o.byte_size, o.last_modified
                    ),
                    None => println!("no backup named {name}"),
                },
            }
        }
    }

    Ok(())
}

/// Resolves on the first Ctrl-C.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; run will not be interruptible");
        std::future::pending::<()>().await;
    }
}

fn print_summary(mode: &str, summary: &RunSummary) {
    println!(
        "{mode} complete: run_id={} cells={} skipped={} saved={} completed={} failed={} interrupted={}",
        summary.run_id,
        summary.total_cells,
        summary.skipped,
        summary.saved,
        summary.completed,
        summary.failed,
        summary.interrupted
    );
}
