//! Offline keyword classifier
//!
//! Deterministic fallback: each configured category's keywords are matched
//! against the normalised report text, and the category with the most hits
//! wins. Confidence grows with the hit count and the margin over the
//! runner-up.

use async_trait::async_trait;

use super::{Classification, Classifier, ClassifierError, ClassifierResult};
use crate::config::ConfigHandle;
use crate::model::ImageRef;

pub struct KeywordClassifier {
    config: ConfigHandle,
}

impl KeywordClassifier {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    fn normalize(text: &str) -> String {
        let cleaned: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    fn confidence(best: usize, runner_up: usize) -> f64 {
        let base: f64 = match best {
            0 => 0.0,
            1 => 0.6,
            2 => 0.75,
            _ => 0.85,
        };
        let margin = if best > runner_up { 0.1 } else { -0.2 };
        (base + margin).clamp(0.0, 0.95)
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(
        &self,
        text: &str,
        _image: Option<&ImageRef>,
    ) -> ClassifierResult<Classification> {
        let config = self.config.current();
        let haystack = Self::normalize(text);

        let mut hits: Vec<(usize, &str)> = config
            .categories
            .iter()
            .map(|category| {
                let count = category
                    .keywords
                    .iter()
                    .filter(|kw| haystack.contains(&Self::normalize(kw)))
                    .count();
                (count, category.name.as_str())
            })
            .collect();
        // Most hits first; config order breaks ties
        hits.sort_by(|a, b| b.0.cmp(&a.0));

        let (best, name) = hits
            .first()
            .copied()
            .ok_or_else(|| ClassifierError::Unavailable("no categories configured".into()))?;
        if best == 0 {
            return Err(ClassifierError::MalformedResponse(
                "no category keyword matched".into(),
            ));
        }
        let runner_up = hits.get(1).map(|h| h.0).unwrap_or(0);
        Ok(Classification::new(name, Self::confidence(best, runner_up)))
    }
}
