//! Civic issue triage daemon
//!
//! Serves the triage engine over a JSONL protocol on stdin/stdout. Logs go
//! to stderr so they never interleave with responses.
//!
//! # Usage
//!
//! ```bash
//! # Serve requests with the built-in policy and the keyword classifier
//! triage-daemon --classifier keyword
//!
//! # Serve with a policy file (reloaded when it changes)
//! triage-daemon --config triage.yaml --snapshot state/registry.json
//!
//! # Validate a policy file
//! triage-daemon --config triage.yaml check-config
//!
//! # Print the dashboard from the last snapshot
//! triage-daemon --snapshot state/registry.json dashboard --limit 10
//! ```

mod config;
mod daemon;
mod handler;
mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use triage::{
    load_snapshot, Classifier, ConfigHandle, Dashboard, EventBus, HttpClassifier,
    HttpImageComparator, ImageComparator, IssueRegistry, KeywordClassifier, TriageConfig,
    TriageOrchestrator,
};

use crate::config::{ClassifierBackend, DaemonConfig};
use crate::daemon::Daemon;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Triage policy file (overrides TRIAGE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry snapshot path (overrides TRIAGE_SNAPSHOT_PATH)
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Classifier backend (overrides TRIAGE_CLASSIFIER)
    #[arg(long, value_enum)]
    classifier: Option<ClassifierBackend>,

    /// Concurrent request limit (overrides TRIAGE_MAX_IN_FLIGHT)
    #[arg(long)]
    max_in_flight: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve JSONL requests on stdin/stdout (default)
    Run,
    /// Load and validate the policy file, then print a summary
    CheckConfig,
    /// Print overview and most urgent issues from the snapshot
    Dashboard {
        /// Number of urgent issues to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = DaemonConfig::from_env();
    if let Some(path) = args.config {
        settings.config_path = Some(path);
    }
    if let Some(path) = args.snapshot {
        settings.snapshot_path = path;
    }
    if let Some(backend) = args.classifier {
        settings.classifier = backend;
    }
    if let Some(max) = args.max_in_flight {
        settings.max_in_flight = max;
    }
    settings.validate()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::CheckConfig => check_config(&settings),
        Command::Dashboard { limit } => dashboard(&settings, limit),
    }
}

fn load_policy(settings: &DaemonConfig) -> Result<TriageConfig> {
    match &settings.config_path {
        Some(path) => TriageConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => {
            info!("No config file given; using built-in policy");
            Ok(TriageConfig::default())
        }
    }
}

async fn run(settings: DaemonConfig) -> Result<()> {
    let config = ConfigHandle::new(load_policy(&settings)?)?;

    let classifier: Arc<dyn Classifier> = match settings.classifier {
        ClassifierBackend::Http => Arc::new(HttpClassifier::new(
            settings.classifier_http.clone(),
            config.clone(),
        )?),
        ClassifierBackend::Keyword => Arc::new(KeywordClassifier::new(config.clone())),
    };
    let comparator: Arc<dyn ImageComparator> =
        Arc::new(HttpImageComparator::new(settings.comparator_http.clone())?);

    let engine = match load_snapshot(&settings.snapshot_path)? {
        Some(snapshot) => {
            info!(
                issues = snapshot.issues.len(),
                path = %settings.snapshot_path.display(),
                "Restoring registry from snapshot"
            );
            TriageOrchestrator::restore(config, classifier, comparator, snapshot)?
        }
        None => TriageOrchestrator::new(config, classifier, comparator),
    }
    .with_event_bus(EventBus::with_history(settings.event_history).shared());

    info!(
        classifier = ?settings.classifier,
        snapshot = %settings.snapshot_path.display(),
        "Starting triage daemon"
    );

    let daemon = Daemon::new(Arc::new(engine), settings);
    let cancel = daemon.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            cancel.cancel();
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    daemon.run(stdin, tokio::io::stdout()).await
}

fn check_config(settings: &DaemonConfig) -> Result<()> {
    let config = load_policy(settings)?;
    config.validate()?;

    let summary = json!({
        "valid": true,
        "categories": config.categories.iter().map(|c| c.name.to_string()).collect::<Vec<_>>(),
        "jurisdictions": config.routing.jurisdictions.len(),
        "dedup_radius_m": config.dedup.radius_m,
        "merge_threshold": config.dedup.merge_threshold,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn dashboard(settings: &DaemonConfig, limit: usize) -> Result<()> {
    let snapshot = load_snapshot(&settings.snapshot_path)?.with_context(|| {
        format!("no snapshot at {}", settings.snapshot_path.display())
    })?;
    let registry = IssueRegistry::restore(snapshot)?;
    let dashboard = Dashboard::from_registry(&registry, Utc::now())?;

    let report = json!({
        "overview": dashboard.overview(),
        "urgent": dashboard.urgent(limit),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
