use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use leadflow_storage::OutputStore;
use leadflow_sync::{
    classify_records, export_classified, parse_keywords, LeadPipeline, PipelineError,
    PipelineSettings, SyncConfig,
};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadflow")]
#[command(about = "Lead acquisition and enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Acquire, filter, re-scrape and export leads for a keyword list.
    Run {
        /// One keyword per line.
        #[arg(long)]
        keywords: PathBuf,
        #[arg(long)]
        min_date: Option<NaiveDate>,
        #[arg(long)]
        max_date: Option<NaiveDate>,
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Defaults to `config/leadflow.yaml` under the workspace root.
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Sort an enriched JSON array into the phone workbook.
    Classify {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        source: Option<String>,
    },
    /// Print the effective settings as YAML.
    Settings {
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_settings(config: &SyncConfig, path: Option<&Path>) -> Result<PipelineSettings> {
    match path {
        Some(path) => PipelineSettings::load(path),
        None => PipelineSettings::load(&config.settings_path()),
    }
}

/// Ctrl-C cancels the run; active remote jobs are aborted before exit.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping run");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run {
            keywords,
            min_date,
            max_date,
            max_concurrency,
            settings,
        } => {
            let mut settings = load_settings(&config, settings.as_deref())?;
            let acquisition = &mut settings.acquisition;
            if min_date.is_some() {
                acquisition.min_date = min_date;
            }
            if max_date.is_some() {
                acquisition.max_date = max_date;
            }
            if let Some(limit) = max_concurrency {
                acquisition.max_concurrency = limit;
            }

            let text = std::fs::read_to_string(&keywords)
                .with_context(|| format!("reading {}", keywords.display()))?;
            let keywords = parse_keywords(&text);
            let pipeline = LeadPipeline::from_config(config, settings)?;

            match pipeline.run_once(&keywords, &cancel_on_ctrl_c()).await {
                Ok(summary) => {
                    let stats = &summary.stats;
                    println!(
                        "run complete: run_id={} jobs_ok={} kept={} mobile={} landline={} other={}",
                        summary.run_id,
                        stats.jobs_succeeded,
                        stats.filtered_rows,
                        stats.mobile,
                        stats.landline,
                        stats.other
                    );
                    for output in &summary.outputs {
                        println!("{}: {}", output.kind, output.path.display());
                    }
                }
                Err(err) => {
                    if let Some(stats) = err.stats() {
                        eprintln!("stage counts: {}", serde_json::to_string(stats)?);
                    }
                    if let PipelineError::Cancelled = err {
                        eprintln!("run stopped by user; no outputs written");
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::Classify { input, source } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let items: Vec<JsonValue> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {} as a JSON array", input.display()))?;
            let source = match source {
                Some(source) => source,
                None => load_settings(&config, None)?.source_name,
            };

            let (headers, buckets) = classify_records(&items);
            let (mobile, landline, other) =
                (buckets.mobile.len(), buckets.landline.len(), buckets.other.len());
            let store = OutputStore::new(config.output_dir.clone());
            let stored =
                export_classified(&store, &source, Utc::now().date_naive(), &headers, buckets)
                    .await?;
            println!(
                "classified {} rows: mobile={} landline={} other={} -> {}",
                items.len(),
                mobile,
                landline,
                other,
                stored.absolute_path.display()
            );
        }
        Commands::Settings { settings } => {
            let settings = load_settings(&config, settings.as_deref())?;
            print!("{}", settings.to_yaml()?);
        }
    }

    Ok(())
}
