//! Classifier Adapter
//!
//! Wraps an external text/image classifier behind the [`Classifier`]
//! capability trait. The adapter owns the timeout and the acceptance gate;
//! implementations only translate a report into a scored label.
//!
//! Any outcome other than an accepted classification is a
//! [`ClassifierError`], which the orchestrator turns into a Manual-Review
//! issue. Reports are never dropped on this path.

pub mod http;
pub mod keyword;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use http::{parse_category, parse_relevance_score, HttpClassifier, HttpClassifierConfig};
pub use keyword::KeywordClassifier;

use crate::config::TriageConfig;
use crate::model::{Category, ImageRef};

/// Scored label for a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    /// Model confidence in `[0, 1]`
    pub confidence: f64,
    /// Optional visual severity signal in `[0, 1]`
    #[serde(default)]
    pub visual_severity: Option<f64>,
}

impl Classification {
    pub fn new(category: impl Into<Category>, confidence: f64) -> Self {
        Self {
            category: category.into(),
            confidence,
            visual_severity: None,
        }
    }

    pub fn with_visual_severity(mut self, visual: f64) -> Self {
        self.visual_severity = Some(visual);
        self
    }
}

/// Reasons a classification is not usable
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed classifier response: {0}")]
    MalformedResponse(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(Category),

    #[error("Confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },
}

/// Result type for classification
pub type ClassifierResult<T> = Result<T, ClassifierError>;

/// External classification capability
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Label a report
    async fn classify(&self, text: &str, image: Option<&ImageRef>)
        -> ClassifierResult<Classification>;
}

/// Timeout and acceptance gate around a [`Classifier`]
#[derive(Clone)]
pub struct ClassifierAdapter {
    inner: Arc<dyn Classifier>,
}

impl ClassifierAdapter {
    pub fn new(inner: Arc<dyn Classifier>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Classify a report under the given configuration.
    ///
    /// Fails with [`ClassifierError::Timeout`] if the call exceeds
    /// `intake.classify_timeout_ms`, with `UnknownCategory` if the label is
    /// not configured, and with `LowConfidence` below `intake.min_confidence`.
    pub async fn classify(
        &self,
        text: &str,
        image: Option<&ImageRef>,
        config: &TriageConfig,
    ) -> ClassifierResult<Classification> {
        let timeout = Duration::from_millis(config.intake.classify_timeout_ms);
        let raw = match tokio::time::timeout(timeout, self.inner.classify(text, image)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(classifier = self.name(), ?timeout, "Classification timed out");
                return Err(ClassifierError::Timeout(timeout));
            }
        };

        let classification = Self::normalize(raw)?;
        debug!(
            classifier = self.name(),
            category = %classification.category,
            confidence = classification.confidence,
            "Report classified"
        );

        if !config.is_known_category(&classification.category) {
            return Err(ClassifierError::UnknownCategory(classification.category));
        }
        if classification.confidence < config.intake.min_confidence {
            return Err(ClassifierError::LowConfidence {
                confidence: classification.confidence,
                threshold: config.intake.min_confidence,
            });
        }
        Ok(classification)
    }

    fn normalize(mut c: Classification) -> ClassifierResult<Classification> {
        if !c.confidence.is_finite() {
            return Err(ClassifierError::MalformedResponse(format!(
                "confidence is not a number: {}",
                c.confidence
            )));
        }
        c.confidence = c.confidence.clamp(0.0, 1.0);
        c.visual_severity = c
            .visual_severity
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0));
        c.category = Category::new(c.category.as_str());
        Ok(c)
    }
}

impl std::fmt::Debug for ClassifierAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierAdapter")
            .field("inner", &self.inner.name())
            .finish()
    }
}
