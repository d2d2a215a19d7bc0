//! # Channel Harvest CLI (`harvest`)
//!
//! The `harvest` binary runs the ingestion pipeline stage by stage or end
//! to end.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest channels` | List configured channels and providers |
//! | `harvest harvest` | Harvest channels and write today's partitions |
//! | `harvest load` | Load partitions into the canonical store |
//! | `harvest classify` | Run object detection on harvested images |
//! | `harvest run` | Harvest → Store → Load → Classify (→ Transform) |
//! | `harvest stats` | Show store statistics |
//! | `harvest export` | Export detection rows as JSON |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! harvest init --config ./config/harvest.toml
//!
//! # Harvest a single channel
//! HARVEST_SOURCE_TOKEN=... harvest harvest --channel chemed
//!
//! # Reload every partition ever written
//! harvest load --all
//!
//! # Classify images referenced by one day's partitions
//! harvest classify --date 2025-01-14
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use channel_harvest::channels;
use channel_harvest::config::{self, Config, LogFormat, LoggingConfig};
use channel_harvest::detect::create_detector;
use channel_harvest::error::PipelineError;
use channel_harvest::export;
use channel_harvest::governor::RateGovernor;
use channel_harvest::migrate;
use channel_harvest::pipeline::{build_coordinator, Components, PartitionScope, RunContext, StageKind};
use channel_harvest::preflight;
use channel_harvest::source::create_source;
use channel_harvest::stats;
use channel_harvest::store::{CanonicalStore, SqliteStore};

/// Channel Harvest CLI: harvest channel messages and media, load them into
/// a canonical store, and classify their images.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Channel Harvest: rate-aware channel harvesting, idempotent loading, and image classification",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `messages` and
    /// `image_detections` tables. Running it multiple times is safe.
    Init,

    /// List configured channels and the source/classifier providers.
    Channels,

    /// Harvest channels and write one partition per channel for today.
    Harvest {
        /// Only harvest this channel.
        #[arg(long)]
        channel: Option<String>,
    },

    /// Load snapshot partitions into the canonical store.
    Load {
        /// Partition day to load (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long, conflicts_with = "all")]
        date: Option<String>,

        /// Load every partition on disk.
        #[arg(long)]
        all: bool,
    },

    /// Classify images referenced by snapshot partitions.
    Classify {
        /// Partition day whose images to classify (YYYY-MM-DD). Defaults to today (UTC).
        #[arg(long, conflicts_with = "all")]
        date: Option<String>,

        /// Classify images of every partition on disk.
        #[arg(long)]
        all: bool,
    },

    /// Run the full pipeline: harvest, store, load, classify, and transform.
    Run,

    /// Show message, image, and detection counts.
    Stats,

    /// Export detection rows as JSON.
    Export {
        /// Output file path. Writes to stdout if omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn parse_scope(date: Option<String>, all: bool) -> Result<Option<PartitionScope>> {
    if all {
        return Ok(Some(PartitionScope::All));
    }
    date.map(|d| {
        NaiveDate::parse_from_str(&d, "%Y-%m-%d")
            .map(PartitionScope::Day)
            .with_context(|| format!("Invalid --date '{}', expected YYYY-MM-DD", d))
    })
    .transpose()
}

/// Cancel the run on Ctrl-C. Stages stop at their next request boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight work");
            token.cancel();
        }
    });
    cancel
}

async fn run_stages(
    cfg: Config,
    requested: &[StageKind],
    scope: Option<PartitionScope>,
    explicit: bool,
) -> Result<()> {
    let credentials = preflight::check(&cfg, requested.contains(&StageKind::Harvest))?;

    let mut kinds = Vec::new();
    for kind in requested {
        let disabled = match kind {
            StageKind::Harvest => (!cfg.source.is_enabled()).then_some("source.provider"),
            StageKind::Classify => (!cfg.classifier.is_enabled()).then_some("classifier.provider"),
            StageKind::Transform => cfg.transform.is_none().then_some("transform.command"),
            _ => None,
        };
        match disabled {
            Some(field) if explicit => {
                return Err(PipelineError::FatalConfiguration(format!(
                    "{} stage requested but {} is not configured",
                    kind, field
                ))
                .into());
            }
            Some(field) => info!(stage = %kind, field, "stage not configured, skipping"),
            None => kinds.push(*kind),
        }
    }

    let store = SqliteStore::connect(&cfg).await?;
    store.ensure_schema().await?;

    let components = Components {
        source: Arc::from(create_source(&cfg.source, &credentials)?),
        detector: Arc::from(create_detector(&cfg.classifier)?),
        store: Arc::new(store.clone()),
        governor: Arc::new(RateGovernor::new()),
    };
    let coordinator = build_coordinator(&cfg, &components, &kinds);

    let mut ctx = RunContext::new(Arc::new(cfg), cancel_on_ctrl_c());
    if let Some(scope) = scope {
        ctx = ctx.with_scope(scope);
    }

    let report = coordinator.run(&ctx).await?;
    for stage in &report.stages {
        stage.print_summary();
    }
    if report.cancelled {
        println!("cancelled");
    }

    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Channels => {
            channels::list_channels(&cfg)?;
        }
        Commands::Harvest { channel } => {
            if let Some(name) = channel {
                if cfg.channel(&name).is_none() {
                    bail!("Unknown channel: '{}'", name);
                }
                cfg.channels.retain(|c| c.name == name);
            }
            run_stages(cfg, &[StageKind::Harvest, StageKind::Store], None, true).await?;
        }
        Commands::Load { date, all } => {
            let scope = parse_scope(date, all)?;
            run_stages(cfg, &[StageKind::Load], scope, true).await?;
        }
        Commands::Classify { date, all } => {
            let scope = parse_scope(date, all)?;
            run_stages(cfg, &[StageKind::Classify], scope, true).await?;
        }
        Commands::Run => {
            run_stages(
                cfg,
                &[
                    StageKind::Harvest,
                    StageKind::Store,
                    StageKind::Load,
                    StageKind::Classify,
                    StageKind::Transform,
                ],
                None,
                false,
            )
            .await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
    }

    Ok(())
}
