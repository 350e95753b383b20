//! Daemon settings
//!
//! Engine policy (categories, thresholds, jurisdictions, SLAs) lives in the
//! triage config file. Everything here is process wiring: where files are,
//! which classifier backend to use, and how often background tasks run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use triage::{HttpClassifierConfig, HttpComparatorConfig};

/// Which classifier backend answers `classify`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ClassifierBackend {
    /// Chat-completions model endpoint
    Http,
    /// Offline keyword matcher driven by the category table
    Keyword,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Triage policy file (YAML, TOML or JSON); built-in defaults if absent
    pub config_path: Option<PathBuf>,
    /// Registry snapshot, restored at startup and written on shutdown
    pub snapshot_path: PathBuf,
    pub classifier: ClassifierBackend,
    pub classifier_http: HttpClassifierConfig,
    pub comparator_http: HttpComparatorConfig,
    /// Requests handled concurrently
    pub max_in_flight: usize,
    /// How often the config file's mtime is checked
    pub reload_poll: Duration,
    /// How often resolved issues past their grace period are closed
    pub sweep_interval: Duration,
    /// Periodic snapshot interval; zero disables periodic saves
    pub snapshot_interval: Duration,
    /// Events retained in memory for inspection
    pub event_history: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            snapshot_path: PathBuf::from("triage-snapshot.json"),
            classifier: ClassifierBackend::Http,
            classifier_http: HttpClassifierConfig::default(),
            comparator_http: HttpComparatorConfig::default(),
            max_in_flight: 64,
            reload_poll: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(300),
            event_history: 1000,
        }
    }
}

impl DaemonConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TRIAGE_CONFIG") {
            config.config_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TRIAGE_SNAPSHOT_PATH") {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Ok(backend) = std::env::var("TRIAGE_CLASSIFIER") {
            match backend.to_lowercase().as_str() {
                "keyword" => config.classifier = ClassifierBackend::Keyword,
                "http" => config.classifier = ClassifierBackend::Http,
                other => tracing::warn!(backend = other, "Unknown TRIAGE_CLASSIFIER, keeping default"),
            }
        }
        if let Ok(max) = std::env::var("TRIAGE_MAX_IN_FLIGHT") {
            if let Ok(n) = max.parse() {
                config.max_in_flight = n;
            }
        }
        if let Some(secs) = env_secs("TRIAGE_RELOAD_POLL_SECS") {
            config.reload_poll = secs;
        }
        if let Some(secs) = env_secs("TRIAGE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = secs;
        }
        if let Some(secs) = env_secs("TRIAGE_SNAPSHOT_INTERVAL_SECS") {
            config.snapshot_interval = secs;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            bail!("max_in_flight must be at least 1");
        }
        if self.reload_poll.is_zero() || self.sweep_interval.is_zero() {
            bail!("reload and sweep intervals must be non-zero");
        }
        Ok(())
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        DaemonConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        let config = DaemonConfig {
            max_in_flight: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
