//! # KeyVis CLI
//!
//! Command-line front end for the heatmap engine: runs the ingest loop,
//! replays sample files into the store and renders heatmap queries as JSON.

#![warn(rust_2018_idioms)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{info, warn};

use keyvis_engine::{
    init_logging, ingest_batches, read_sample_batches, run_ingest_loop, EngineConfig,
    FileRegionSource, HeatmapQuery, HeatmapTag, KeyVisError, KeyVisResult, KeyVisualStore,
    StatMode, Timestamp, ENGINE_FULL_NAME, ENGINE_VERSION,
};

// ============================================================================
// SECTION 1: CLI ARGUMENT PARSER
// ============================================================================

/// KeyVis heatmap engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "keyvis",
    author = "AIOps Team",
    version,
    about = "Key-range load heatmap engine",
    long_about = "KeyVis ingests periodic per-key-range load snapshots, keeps them in \
                  tiered multi-resolution storage and renders time/key-range queries \
                  as fixed-resolution heatmap matrices."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "keyvis.toml", env = "KEYVIS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "KEYVIS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "KEYVIS_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ingest loop over a JSON-lines sample file until Ctrl-C
    Run {
        /// Sample file, one batch per line
        #[arg(short, long)]
        samples: PathBuf,
    },

    /// Append every batch of a JSON-lines sample file and exit
    Ingest {
        /// Sample file, one batch per line
        file: PathBuf,
    },

    /// Render a heatmap for a time window as JSON
    Query {
        /// Window start (RFC 3339 or unix seconds, default: one hour before end)
        #[arg(long, value_parser = parse_time)]
        start: Option<Timestamp>,

        /// Window end (RFC 3339 or unix seconds, default: now)
        #[arg(long, value_parser = parse_time)]
        end: Option<Timestamp>,

        /// First key of the range
        #[arg(long, default_value = "")]
        start_key: String,

        /// Last key of the range (empty: end of key space)
        #[arg(long, default_value = "")]
        end_key: String,

        /// Metric to render (omit for the full multi-metric value)
        #[arg(short, long)]
        tag: Option<HeatmapTag>,

        /// How the metric folds across cells (max, average)
        #[arg(short, long, default_value = "max")]
        mode: StatMode,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

fn parse_time(raw: &str) -> Result<Timestamp, String> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Timestamp::checked_from_secs(secs)
            .ok_or_else(|| format!("unix seconds out of range: {}", secs));
    }
    let dt = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("expected RFC 3339 or unix seconds: {}", e))?
        .with_timezone(&Utc);
    if dt.timestamp_nanos_opt().is_none() {
        return Err(format!("time out of range: {}", raw));
    }
    Ok(Timestamp::from_datetime(dt))
}

// ============================================================================
// SECTION 2: CLI HANDLER FUNCTIONS
// ============================================================================

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> KeyVisResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Ingest interval: {}s", config.engine.ingest_interval_secs);
            println!("  • Storage backend: {:?}", config.storage.backend);
            println!(
                "  • Query resolution: {} rows x {} columns",
                config.query.time_rows, config.query.key_columns
            );
            println!("  • Retention tiers:");
            for (level, tier) in config.retention.tiers.iter().enumerate() {
                if tier.is_bounded() {
                    println!(
                        "    - tier {}: {} axes, compacting {} at a time",
                        level, tier.capacity, tier.compact_ratio
                    );
                } else {
                    println!("    - tier {}: unbounded", level);
                }
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(KeyVisError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> KeyVisResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("🔥 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Tiered multi-resolution retention");
    println!("  • Threshold-driven key compression");
    println!("  • Checksummed append-only axis log");
    println!();
    println!("License: MIT");
}

fn open_store(config: &EngineConfig) -> KeyVisResult<Arc<KeyVisualStore>> {
    let kv = config.storage.open_kv()?;
    Ok(Arc::new(KeyVisualStore::open(config, kv)?))
}

async fn handle_run(config: &EngineConfig, samples: &Path) -> AnyhowResult<()> {
    let store = open_store(config).context("Failed to open store")?;
    let source = FileRegionSource::open(samples)
        .with_context(|| format!("Failed to load samples from {}", samples.display()))?;

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "keyvis::main", "Received Ctrl-C");
            signal.notify_one();
        }
    });

    let interval: Duration = config.ingest_interval();
    run_ingest_loop(store.clone(), Arc::new(source), interval, shutdown).await?;

    let stats = store.stats();
    info!(
        target: "keyvis::main",
        appends = stats.appends,
        cascades = stats.cascades,
        scan_failures = stats.scan_failures,
        "Ingest loop finished"
    );
    Ok(())
}

fn handle_ingest(config: &EngineConfig, file: &Path) -> AnyhowResult<()> {
    let store = open_store(config).context("Failed to open store")?;
    let batches = read_sample_batches(file)
        .with_context(|| format!("Failed to read samples from {}", file.display()))?;

    let stored = ingest_batches(&store, &batches)?;
    let stats = store.stats();
    println!(
        "✅ Stored {} of {} batches ({} cascades, {} bytes persisted)",
        stored,
        batches.len(),
        stats.cascades,
        stats.persisted_bytes
    );
    Ok(())
}

fn handle_query(config: &EngineConfig, query: HeatmapQuery) -> AnyhowResult<()> {
    let store = open_store(config).context("Failed to open store")?;

    match store.heatmap(&query) {
        Some(heatmap) => {
            let json = serde_json::to_string_pretty(&heatmap).context("Failed to encode heatmap")?;
            println!("{}", json);
        }
        None => {
            warn!(
                target: "keyvis::main",
                start = %query.start_time,
                end = %query.end_time,
                "No data in window"
            );
            println!("null");
        }
    }
    Ok(())
}

// ============================================================================
// SECTION 3: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need a store
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!(
            target: "keyvis::main",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!(target: "keyvis::main", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Commands::Run { samples } => handle_run(&config, &samples).await?,
        Commands::Ingest { file } => handle_ingest(&config, &file)?,
        Commands::Query {
            start,
            end,
            start_key,
            end_key,
            tag,
            mode,
        } => {
            let end_time = end.unwrap_or_else(Timestamp::now);
            let start_time =
                start.unwrap_or_else(|| end_time.sub_duration(Duration::from_secs(3600)));
            handle_query(
                &config,
                HeatmapQuery {
                    start_time,
                    end_time,
                    start_key,
                    end_key,
                    tag,
                    mode,
                },
            )?;
        }
        Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}
