//! Severity Scorer
//!
//! Pure, deterministic mapping from a classification to an ordinal 1..=5
//! severity:
//!
//! ```text
//! raw = base_weight(category)
//!     + (confidence - 0.5) * confidence_gain
//!     + (visual - 0.5)     * visual_gain      (only when a visual signal exists)
//! severity = clamp(round(raw), 1, 5)
//! ```
//!
//! Identical inputs always give identical scores, so every score can be
//! reproduced from the audit trail.

use serde::{Deserialize, Serialize};

use crate::config::TriageConfig;
use crate::model::{Category, Severity};

/// Every term of a severity computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub category: Category,
    pub base_weight: f64,
    pub confidence_term: f64,
    pub visual_term: f64,
    pub raw: f64,
    pub severity: Severity,
}

/// Scorer bound to one configuration snapshot
#[derive(Debug, Clone, Copy)]
pub struct SeverityScorer<'a> {
    config: &'a TriageConfig,
}

impl<'a> SeverityScorer<'a> {
    pub fn new(config: &'a TriageConfig) -> Self {
        Self { config }
    }

    /// Ordinal severity for a classification
    pub fn score(&self, category: &Category, confidence: f64, visual: Option<f64>) -> Severity {
        self.explain(category, confidence, visual).severity
    }

    /// Severity with the individual terms that produced it
    pub fn explain(&self, category: &Category, confidence: f64, visual: Option<f64>) -> ScoreBreakdown {
        let weights = &self.config.severity;
        let base_weight = self
            .config
            .category(category)
            .map(|c| c.base_weight)
            .unwrap_or(weights.default_base_weight);

        let confidence = sanitize(confidence);
        let confidence_term = (confidence - 0.5) * weights.confidence_gain;
        let visual_term = visual
            .filter(|v| v.is_finite())
            .map(|v| (v.clamp(0.0, 1.0) - 0.5) * weights.visual_gain)
            .unwrap_or(0.0);

        let raw = base_weight + confidence_term + visual_term;
        ScoreBreakdown {
            category: category.clone(),
            base_weight,
            confidence_term,
            visual_term,
            raw,
            severity: Severity::from_raw(raw),
        }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
