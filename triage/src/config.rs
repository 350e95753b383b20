//! Triage configuration
//!
//! Every policy input the engine uses is externally supplied: the category
//! table and base weights, the merge radius and similarity threshold, the
//! jurisdiction boundaries, and the SLA durations. Configuration is loaded
//! from YAML or TOML, validated, and published through a [`ConfigHandle`]
//! that can be swapped at runtime without disturbing in-flight requests.
//!
//! # Example
//!
//! ```yaml
//! categories:
//!   - name: pothole
//!     base_weight: 2.0
//!     keywords: [pothole, crater, road damage]
//!   - name: drainage
//!     base_weight: 3.0
//!     compatible_with: [waterlogging]
//! dedup:
//!   radius_m: 500
//!   merge_threshold: 0.55
//! routing:
//!   jurisdictions:
//!     - name: ward-12
//!       default_department: public-works
//!       boundary:
//!         - { lat: 12.80, lon: 77.50 }
//!         - { lat: 12.80, lon: 77.70 }
//!         - { lat: 13.00, lon: 77.70 }
//!         - { lat: 13.00, lon: 77.50 }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{Category, DepartmentId, GeoPoint, ImagePolicy, Severity};

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported config format: {0} (expected .yaml, .yml, .toml or .json)")]
    UnsupportedFormat(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A known issue category and its policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: Category,
    /// Base severity weight on the 1..=5 scale
    pub base_weight: f64,
    /// Keywords for the offline keyword classifier
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Categories whose open issues may absorb reports of this category
    #[serde(default)]
    pub compatible_with: Vec<Category>,
    /// SLA hours indexed by severity 1..=5; falls back to `sla.default_hours`
    #[serde(default)]
    pub sla_hours: Option<[u32; 5]>,
}

impl CategoryConfig {
    pub fn new(name: impl Into<Category>, base_weight: f64) -> Self {
        Self {
            name: name.into(),
            base_weight,
            keywords: Vec::new(),
            compatible_with: Vec::new(),
            sla_hours: None,
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn compatible_with(mut self, other: impl Into<Category>) -> Self {
        self.compatible_with.push(other.into());
        self
    }
}

/// Duplicate detection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Candidates farther than this are never merged
    pub radius_m: f64,
    /// Minimum combined similarity for a merge
    pub merge_threshold: f64,
    /// Weight of geographic proximity in the combined score
    pub geo_weight: f64,
    /// Weight of text similarity in the combined score
    pub text_weight: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            radius_m: 500.0,
            merge_threshold: 0.55,
            geo_weight: 0.5,
            text_weight: 0.5,
        }
    }
}

/// Severity scoring coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    /// Score shift per unit of classifier confidence above/below 0.5
    pub confidence_gain: f64,
    /// Score shift per unit of visual severity above/below 0.5
    pub visual_gain: f64,
    /// Base weight for categories missing from the table
    pub default_base_weight: f64,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            confidence_gain: 1.0,
            visual_gain: 2.0,
            default_base_weight: 2.0,
        }
    }
}

/// SLA durations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Hours to resolve, indexed by severity 1..=5
    pub default_hours: [u32; 5],
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            default_hours: [168, 120, 72, 48, 24],
        }
    }
}

/// A jurisdiction boundary and its department table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionConfig {
    pub name: String,
    /// Polygon vertices in order; closed implicitly
    pub boundary: Vec<GeoPoint>,
    /// Department for categories without a dedicated entry
    pub default_department: DepartmentId,
    #[serde(default)]
    pub departments: BTreeMap<Category, DepartmentId>,
}

/// Jurisdiction table, matched in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub jurisdictions: Vec<JurisdictionConfig>,
}

/// Resolution proof checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    /// Maximum distance between proof location and issue centroid
    pub location_tolerance_m: f64,
    /// Minimum change score for the after-image to count as a visible fix
    pub min_visual_change: f64,
    /// Timeout for the external visual comparison
    pub compare_timeout_ms: u64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            location_tolerance_m: 100.0,
            min_visual_change: 0.3,
            compare_timeout_ms: 10_000,
        }
    }
}

/// Report intake policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Classification calls exceeding this are treated as failures
    pub classify_timeout_ms: u64,
    /// Classifications below this confidence go to manual review
    pub min_confidence: f64,
    pub image: ImagePolicy,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            classify_timeout_ms: 5_000,
            min_confidence: 0.4,
            image: ImagePolicy::default(),
        }
    }
}

/// Lifecycle timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Delay between an accepted proof and closure, during which the
    /// resolution can still be disputed
    pub closure_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            closure_grace_secs: 72 * 3600,
        }
    }
}

/// Complete triage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    pub categories: Vec<CategoryConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub severity: SeverityConfig,
    #[serde(default)]
    pub sla: SlaConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub proof: ProofConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            dedup: DedupConfig::default(),
            severity: SeverityConfig::default(),
            sla: SlaConfig::default(),
            routing: RoutingConfig::default(),
            proof: ProofConfig::default(),
            intake: IntakeConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig::new("pothole", 2.0).with_keywords(&[
            "pothole",
            "crater",
            "road damage",
            "broken road",
        ]),
        CategoryConfig::new("streetlight", 1.5).with_keywords(&[
            "streetlight",
            "street light",
            "lamp",
            "dark street",
        ]),
        CategoryConfig::new("garbage", 2.0).with_keywords(&[
            "garbage",
            "trash",
            "waste",
            "litter",
            "dump",
        ]),
        CategoryConfig::new("drainage", 3.0)
            .with_keywords(&["drain", "drainage", "clogged", "overflow"])
            .compatible_with("waterlogging")
            .compatible_with("sewage"),
        CategoryConfig::new("waterlogging", 3.0).with_keywords(&[
            "waterlogging",
            "waterlogged",
            "flooded",
            "flooding",
        ]),
        CategoryConfig::new("sewage", 3.5).with_keywords(&["sewage", "sewer", "manhole"]),
        CategoryConfig::new("water_supply", 3.0).with_keywords(&[
            "water supply",
            "no water",
            "pipeline",
            "leak",
        ]),
        CategoryConfig::new("electricity", 3.5).with_keywords(&[
            "electricity",
            "power cut",
            "live wire",
            "transformer",
        ]),
        CategoryConfig::new("traffic_signal", 3.5).with_keywords(&[
            "traffic signal",
            "traffic light",
            "signal",
        ]),
        CategoryConfig::new("sidewalk", 1.5).with_keywords(&[
            "sidewalk",
            "footpath",
            "pavement",
        ]),
    ]
}

impl TriageConfig {
    /// Load and validate a config file; the format follows the extension
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let config = Self::parse(&raw, &ext)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config text in the named format (`yaml`, `yml`, `toml`, `json`)
    pub fn parse(raw: &str, format: &str) -> ConfigResult<Self> {
        match format {
            "yaml" | "yml" => {
                serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            "toml" => toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string())),
            "json" => serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string())),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("no categories configured".into()));
        }

        let mut names = HashSet::new();
        for cat in &self.categories {
            if cat.name.as_str().is_empty() || cat.name.is_unclassified() {
                return Err(ConfigError::Invalid(format!(
                    "reserved or empty category name '{}'",
                    cat.name
                )));
            }
            if !names.insert(cat.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate category '{}'",
                    cat.name
                )));
            }
            if !(1.0..=5.0).contains(&cat.base_weight) {
                return Err(ConfigError::Invalid(format!(
                    "category '{}' base_weight {} outside 1..=5",
                    cat.name, cat.base_weight
                )));
            }
            if let Some(hours) = &cat.sla_hours {
                if hours.iter().any(|h| *h == 0) {
                    return Err(ConfigError::Invalid(format!(
                        "category '{}' has a zero SLA",
                        cat.name
                    )));
                }
            }
        }
        for cat in &self.categories {
            for other in &cat.compatible_with {
                if !names.contains(other) {
                    return Err(ConfigError::Invalid(format!(
                        "category '{}' lists unknown compatible category '{}'",
                        cat.name, other
                    )));
                }
            }
        }

        let d = &self.dedup;
        if !(d.radius_m.is_finite() && d.radius_m > 0.0) {
            return Err(ConfigError::Invalid("dedup.radius_m must be positive".into()));
        }
        if !(0.0..=1.0).contains(&d.merge_threshold) {
            return Err(ConfigError::Invalid(
                "dedup.merge_threshold must be within 0..=1".into(),
            ));
        }
        if d.geo_weight < 0.0 || d.text_weight < 0.0 || d.geo_weight + d.text_weight <= 0.0 {
            return Err(ConfigError::Invalid(
                "dedup weights must be non-negative with a positive sum".into(),
            ));
        }

        if !(1.0..=5.0).contains(&self.severity.default_base_weight) {
            return Err(ConfigError::Invalid(
                "severity.default_base_weight outside 1..=5".into(),
            ));
        }
        if self.sla.default_hours.iter().any(|h| *h == 0) {
            return Err(ConfigError::Invalid("sla.default_hours contains zero".into()));
        }

        for j in &self.routing.jurisdictions {
            if j.boundary.len() < 3 {
                return Err(ConfigError::Invalid(format!(
                    "jurisdiction '{}' needs at least 3 boundary points",
                    j.name
                )));
            }
            if let Some(bad) = j.boundary.iter().find(|p| !p.is_valid()) {
                return Err(ConfigError::Invalid(format!(
                    "jurisdiction '{}' has invalid boundary point {}",
                    j.name, bad
                )));
            }
            if j.default_department.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "jurisdiction '{}' has no default department",
                    j.name
                )));
            }
        }

        if !(self.proof.location_tolerance_m.is_finite() && self.proof.location_tolerance_m > 0.0)
        {
            return Err(ConfigError::Invalid(
                "proof.location_tolerance_m must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.proof.min_visual_change) {
            return Err(ConfigError::Invalid(
                "proof.min_visual_change must be within 0..=1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.intake.min_confidence) {
            return Err(ConfigError::Invalid(
                "intake.min_confidence must be within 0..=1".into(),
            ));
        }
        if self.intake.image.min_dimension > self.intake.image.max_dimension {
            return Err(ConfigError::Invalid(
                "intake.image.min_dimension exceeds max_dimension".into(),
            ));
        }

        Ok(())
    }

    /// Look up a category's policy
    pub fn category(&self, category: &Category) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| &c.name == category)
    }

    pub fn is_known_category(&self, category: &Category) -> bool {
        self.category(category).is_some()
    }

    /// The category itself plus every category compatible with it, in
    /// either direction
    pub fn compatible_categories(&self, category: &Category) -> Vec<Category> {
        let mut out = vec![category.clone()];
        if let Some(cfg) = self.category(category) {
            out.extend(cfg.compatible_with.iter().cloned());
        }
        for cfg in &self.categories {
            if cfg.compatible_with.contains(category) {
                out.push(cfg.name.clone());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// SLA duration for a category at a severity
    pub fn sla_for(&self, category: &Category, severity: Severity) -> chrono::Duration {
        let hours = self
            .category(category)
            .and_then(|c| c.sla_hours)
            .unwrap_or(self.sla.default_hours)[severity.index()];
        chrono::Duration::hours(hours as i64)
    }
}

/// Shared, hot-swappable configuration.
///
/// Readers take a cheap `Arc` snapshot once per operation, so a reload in
/// the middle of a request never mixes two configurations.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<TriageConfig>>>,
    version: Arc<AtomicU64>,
}

impl ConfigHandle {
    /// Validate and publish an initial configuration
    pub fn new(config: TriageConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            version: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> Arc<TriageConfig> {
        // The lock only guards an Arc swap, so a poisoned lock still holds a
        // complete value.
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Monotonic version, bumped on every successful reload
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Validate and atomically replace the configuration.
    ///
    /// On error the previous configuration stays in effect.
    pub fn reload(&self, config: TriageConfig) -> ConfigResult<u64> {
        config.validate()?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version, "Triage configuration reloaded");
        Ok(version)
    }

    /// Reload from a file
    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> ConfigResult<u64> {
        let config = TriageConfig::from_path(path)?;
        self.reload(config)
    }
}
