use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use legendtrack_core::{TopicStatus, TopicUpdate};
use legendtrack_sync::{ensure_fresh, exporter_for, EnsureOutcome, ExportOutcome, SyncConfig, SyncRuntime};
use legendtrack_web::AppState;
use legendtrack_workbook::{apply_update, load_snapshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "legendtrack")]
#[command(about = "Keep LegendTrack's JSON data in sync with the tracker workbook")]
struct Cli {
    /// YAML config file (defaults to ./legendtrack.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tracker workbook; overrides TRACKER_PATH and the config file.
    #[arg(long, global = true)]
    tracker: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export topics.json and projects.json once.
    Export,
    /// Export only if the JSON is missing or older than the workbook.
    Ensure,
    /// Export, then re-export whenever the workbook changes.
    Watch,
    /// HTTP API plus the workbook watcher.
    Serve,
    /// Write depth/status fields of one topic back into the workbook.
    Update {
        id: String,
        #[arg(long)]
        depth_target: Option<String>,
        #[arg(long)]
        current_depth: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Print progress counts for the current workbook.
    Summary {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

fn print_outcome(outcome: &ExportOutcome) {
    match outcome {
        ExportOutcome::Written(summary) => println!(
            "export complete: topics={} projects={} topics_sha256={}",
            summary.topics, summary.projects, summary.topics_sha256
        ),
        ExportOutcome::External => println!("export command complete"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env_with_file(cli.config.as_deref())?;
    if let Some(tracker) = cli.tracker {
        config.tracker_path = tracker;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Export => {
            let outcome = exporter_for(&config)?.export().await?;
            print_outcome(&outcome);
        }
        Commands::Ensure => match ensure_fresh(&config).await? {
            EnsureOutcome::WorkbookMissing => {
                println!("tracker not found at {}", config.tracker_path.display())
            }
            EnsureOutcome::UpToDate => println!("exported data is up to date"),
            EnsureOutcome::Exported(freshness, outcome) => {
                println!("exported data was {freshness:?}");
                print_outcome(&outcome);
            }
        },
        Commands::Watch => {
            let runtime = SyncRuntime::new(config)?;
            let watcher = runtime.spawn_watcher().await?;
            shutdown_signal().await;
            watcher.abort();
        }
        Commands::Serve => {
            let runtime = SyncRuntime::new(config)?;
            let watcher = match runtime.spawn_watcher().await {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "workbook watcher not started; serving without live export");
                    None
                }
            };
            legendtrack_web::serve(AppState::new(runtime), shutdown_signal()).await?;
            if let Some(handle) = watcher {
                handle.abort();
            }
        }
        Commands::Update {
            id,
            depth_target,
            current_depth,
            status,
        } => {
            let update = TopicUpdate {
                depth_target,
                current_depth,
                status,
            };
            let path = config.tracker_path.clone();
            let topic_id = id.clone();
            let applied = tokio::task::spawn_blocking(move || apply_update(&path, &topic_id, &update))
                .await
                .context("update task panicked")??;
            println!("updated {id}: {}", applied.columns.join(", "));
            let outcome = exporter_for(&config)?.export().await?;
            print_outcome(&outcome);
        }
        Commands::Summary { json } => {
            let path = config.tracker_path.clone();
            let snapshot = tokio::task::spawn_blocking(move || load_snapshot(&path))
                .await
                .context("snapshot task panicked")??;
            let summary = snapshot.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("topics: {}", summary.total);
                for status in TopicStatus::ALL {
                    let count = summary.status_counts.get(&status).copied().unwrap_or(0);
                    println!("  {:<12} {count}", status.label());
                }
                println!("mastered: {}%", summary.mastered_percent);
            }
        }
    }

    Ok(())
}
