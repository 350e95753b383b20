//! Core data model for the triage engine
//!
//! - [`Report`]: a single citizen submission, immutable once accepted
//! - [`Issue`]: the authoritative, mutable aggregate of one or more reports
//! - [`ResolutionProof`]: department evidence that an issue is fixed

pub mod geo;
pub mod image;
pub mod issue;
pub mod proof;
pub mod report;

use serde::{Deserialize, Serialize};

pub use geo::{Centroid, GeoPoint, ReportedLocation};
pub use image::{ImagePolicy, ImageRef, ImageRejection};
pub use issue::{AuditEntry, AuditEvent, FeedbackTally, Issue};
pub use proof::ResolutionProof;
pub use report::{Channel, Report, ReportInput};

/// Unique identifier for issues
pub type IssueId = String;

/// Unique identifier for reports
pub type ReportId = String;

/// Department or queue identifier
pub type DepartmentId = String;

/// Queue that receives issues no jurisdiction claims
pub const UNASSIGNED_QUEUE: &str = "unassigned";

/// Issue category.
///
/// Open-ended: the known set, its weights and its SLA tables come from
/// configuration. Names are normalised to lowercase snake case so that
/// `"Water Supply"` and `"water_supply"` are the same category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Category(String);

impl Category {
    /// Placeholder category for reports awaiting manual review
    pub const UNCLASSIFIED: &'static str = "unclassified";

    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name
            .as_ref()
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        Self(normalized)
    }

    pub fn unclassified() -> Self {
        Self(Self::UNCLASSIFIED.to_string())
    }

    pub fn is_unclassified(&self) -> bool {
        self.0 == Self::UNCLASSIFIED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordinal severity on a fixed 1..=5 scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Severity(u8);

impl Severity {
    pub const MIN: Severity = Severity(1);
    pub const MAX: Severity = Severity(5);

    /// Create a severity, rejecting values outside 1..=5
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN.0..=Self::MAX.0)
            .contains(&value)
            .then_some(Self(value))
    }

    /// Round a raw score to the nearest level and clamp it onto the scale
    pub fn from_raw(raw: f64) -> Self {
        if !raw.is_finite() {
            return Self::MIN;
        }
        let rounded = raw.round().clamp(Self::MIN.0 as f64, Self::MAX.0 as f64);
        Self(rounded as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based index into per-severity tables
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("severity {} outside 1..=5", value))
    }
}

impl From<Severity> for u8 {
    fn from(value: Severity) -> Self {
        value.0
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
