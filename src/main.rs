//! beacon-hunt: C2 beacon detection over aggregated connection logs.
//!
//! Reads pre-aggregated host-pair connection histories, scores each pair for
//! timer-driven regularity and records the verdicts in a persistent store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────┐
//! │  Collector  │────>│ Analyzer xN │────>│   Writer    │────>│  Store  │
//! │   (jsonl)   │ ch1 │  (scoring)  │ ch2 │  (single)   │     │ (json)  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────┘
//! ```
//!
//! - **Collector**: Streams one connection pair per line
//! - **Analyzer**: Worker tasks computing timing and size scores
//! - **Writer**: The only task that touches the store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use beacon_hunt::collector::JsonLinesCollector;
use beacon_hunt::config::Config;
use beacon_hunt::error::{PipelineError, Result};
use beacon_hunt::export::{
    decode_records, export_beacons, export_hosts, export_run_report, top_beacons, top_hosts,
    OutputFormat,
};
use beacon_hunt::model::{BeaconRecord, Document, HostAggregate, Selector};
use beacon_hunt::pipeline::{Pipeline, RunReport};
use beacon_hunt::scoring::BeaconScorer;
use beacon_hunt::store::{MemoryStore, Store};

/// beacon-hunt: C2 beacon detection through connection log analysis.
#[derive(Parser, Debug)]
#[command(name = "beacon-hunt")]
#[command(author = "Security Team")]
#[command(version = "0.1.0")]
#[command(about = "Detect C2 beaconing behavior via statistical analysis of connection logs")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze connection pairs and update the store.
    Analyze {
        /// JSON Lines file with one connection pair per line.
        #[arg(short, long)]
        input: PathBuf,

        /// Store snapshot path (overrides the config file).
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of analyzer workers.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Beacon score threshold (0.0 - 1.0).
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Run report format: text, json, jsonl.
        #[arg(short, long)]
        output: Option<String>,

        /// Write run counters in Prometheus text format to this file.
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Enable verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },

    /// List stored beacons, most suspicious first.
    ShowBeacons {
        /// Store snapshot path (overrides the config file).
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format: text, json, jsonl.
        #[arg(short, long)]
        output: Option<String>,

        /// Maximum number of beacons to show.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List hosts involved in beacons.
    ShowHosts {
        /// Store snapshot path (overrides the config file).
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format: text, json, jsonl.
        #[arg(short, long)]
        output: Option<String>,

        /// Maximum number of hosts to show.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print a default configuration file.
    GenerateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            store,
            config,
            workers,
            threshold,
            output,
            metrics,
            verbose,
        } => {
            init_logging(verbose)?;

            let mut config = load_config(config.as_deref())?;
            if let Some(path) = store {
                config.store.path = path;
            }
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
                config.pipeline.work_buffer = workers * 2;
            }
            if let Some(threshold) = threshold {
                config.scoring.params.threshold = threshold;
            }
            if let Some(format) = output {
                config.output.format = parse_format(&format)?;
            }
            config.validate().context("Invalid configuration")?;

            run_analysis(&input, &config, metrics.as_deref()).await
        }

        Commands::ShowBeacons {
            store,
            config,
            output,
            limit,
        } => {
            init_logging(false)?;
            let config = display_config(config.as_deref(), store, output, limit)?;

            let documents = read_collection(&config, &config.store.collections.beacon).await?;
            let records: Vec<BeaconRecord> =
                decode_records(&config.store.collections.beacon, documents);
            let top = top_beacons(records, config.output.limit);
            println!("{}", export_beacons(&top, config.output.format));
            Ok(())
        }

        Commands::ShowHosts {
            store,
            config,
            output,
            limit,
        } => {
            init_logging(false)?;
            let config = display_config(config.as_deref(), store, output, limit)?;

            let documents = read_collection(&config, &config.store.collections.host).await?;
            let hosts: Vec<HostAggregate> = decode_records(&config.store.collections.host, documents);
            let top = top_hosts(hosts, config.output.limit);
            println!("{}", export_hosts(&top, config.output.format));
            Ok(())
        }

        Commands::GenerateConfig => {
            println!("{}", Config::generate_default());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn parse_format(format: &str) -> Result<OutputFormat> {
    format.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn display_config(
    config: Option<&Path>,
    store: Option<PathBuf>,
    output: Option<String>,
    limit: Option<usize>,
) -> Result<Config> {
    let mut config = load_config(config)?;
    if let Some(path) = store {
        config.store.path = path;
    }
    if let Some(format) = output {
        config.output.format = parse_format(&format)?;
    }
    if let Some(limit) = limit {
        config.output.limit = limit;
    }
    Ok(config)
}

async fn open_store(path: &Path) -> Result<MemoryStore> {
    MemoryStore::load(path)
        .await
        .with_context(|| format!("Failed to load store: {}", path.display()))
}

async fn read_collection(
    config: &Config,
    collection: &str,
) -> Result<Vec<(Selector, Document)>> {
    let store = open_store(&config.store.path).await?;
    let mut handle = store.acquire().await.context("Failed to acquire store handle")?;
    let documents = handle
        .find_all(collection)
        .await
        .with_context(|| format!("Failed to read collection {}", collection))?;
    Ok(documents)
}

async fn run_analysis(input: &Path, config: &Config, metrics: Option<&Path>) -> Result<()> {
    info!("Starting beacon-hunt analysis of {}", input.display());

    let params = config.scoring.effective();
    info!(
        "Profile {}: threshold {:.2}, min connections {}, {} workers",
        config.scoring.profile, params.threshold, params.min_connections, config.pipeline.workers
    );

    let store = open_store(&config.store.path).await?;
    let mut collector = JsonLinesCollector::open(input)
        .await
        .with_context(|| format!("Failed to open input: {}", input.display()))?;

    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        Arc::new(BeaconScorer::new(params)),
        config.store.collections.clone(),
    );

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, finishing in-flight pairs...");
            shutdown.request();
        }
    });

    let outcome = pipeline.run(&mut collector, &store).await;

    // Whatever was applied is kept, even when the run failed part way.
    store
        .save(&config.store.path)
        .await
        .with_context(|| format!("Failed to save store: {}", config.store.path.display()))?;
    info!("Store saved to {}", config.store.path.display());

    match outcome {
        Ok(report) => {
            publish_report(&report, config, metrics).await?;
            Ok(())
        }
        Err(PipelineError::Collector { source, report }) => {
            publish_report(&report, config, metrics).await?;
            Err(anyhow::Error::new(source).context("Collector failed, run is incomplete"))
        }
        Err(PipelineError::Writer { source, report }) => {
            publish_report(&report, config, metrics).await?;
            Err(anyhow::Error::new(source).context("Writer failed, queued updates were lost"))
        }
        Err(e) => Err(e.into()),
    }
}

async fn publish_report(report: &RunReport, config: &Config, metrics: Option<&Path>) -> Result<()> {
    println!("{}", export_run_report(report, config.output.format));
    if let Some(path) = metrics {
        tokio::fs::write(path, report.stats.to_prometheus_format())
            .await
            .with_context(|| format!("Failed to write metrics: {}", path.display()))?;
        info!("Metrics written to {}", path.display());
    }
    Ok(())
}
