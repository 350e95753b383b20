//! Visual comparison capability

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{VerifierError, VerifierResult};
use crate::classifier::parse_relevance_score;
use crate::model::ImageRef;

/// Direction of the change between before- and after-image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDirection {
    Improved,
    Unchanged,
    Worsened,
}

/// Comparator output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualChange {
    /// Magnitude of the difference in `[0, 1]`
    pub score: f64,
    pub direction: ChangeDirection,
}

/// External image comparison
#[async_trait]
pub trait ImageComparator: Send + Sync {
    fn name(&self) -> &str;

    /// Compare an after-image against the stored before-image. `before` is
    /// `None` when no report carried a usable image; implementations then
    /// judge the after-image on its own.
    async fn compare(&self, before: Option<&ImageRef>, after: &ImageRef) -> VerifierResult<VisualChange>;
}

/// Endpoint settings for [`HttpImageComparator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpComparatorConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for HttpComparatorConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("TRIAGE_COMPARATOR_URL").unwrap_or_else(|_| {
                "http://localhost:8000/v1/chat/completions".to_string()
            }),
            model: std::env::var("TRIAGE_COMPARATOR_MODEL")
                .unwrap_or_else(|_| "civic-vision".to_string()),
            api_key: std::env::var("TRIAGE_COMPARATOR_API_KEY").ok(),
        }
    }
}

/// Comparator backed by a vision model behind a chat-completions endpoint
pub struct HttpImageComparator {
    http: reqwest::Client,
    config: HttpComparatorConfig,
}

const COMPARE_PROMPT: &str = r#"You verify civic repair work.
You are given a BEFORE image of a reported civic problem and an AFTER image
submitted as proof of repair. Judge whether the problem visibly changed.

Respond EXACTLY in this format:
change: <number 0-100>
direction: improved | unchanged | worsened"#;

impl HttpImageComparator {
    pub fn new(config: HttpComparatorConfig) -> VerifierResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| VerifierError::Comparator(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ImageComparator for HttpImageComparator {
    fn name(&self) -> &str {
        "http"
    }

    async fn compare(&self, before: Option<&ImageRef>, after: &ImageRef) -> VerifierResult<VisualChange> {
        let user = format!(
            "BEFORE: {}\nAFTER: {}",
            before.map(|b| b.uri.as_str()).unwrap_or("(none)"),
            after.uri
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": COMPARE_PROMPT },
                { "role": "user", "content": user },
            ],
            "temperature": 0.0,
            "max_tokens": 32,
        });

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| VerifierError::Comparator(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VerifierError::Comparator(format!("HTTP {}: {}", status, text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VerifierError::Comparator(e.to_string()))?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| VerifierError::Comparator("No response".to_string()))?;

        parse_visual_change(content)
    }
}

/// Read `change:` / `direction:` lines from model output
pub fn parse_visual_change(text: &str) -> VerifierResult<VisualChange> {
    let direction = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("direction"))
        .map(|(_, value)| value.trim().to_lowercase())
        .ok_or_else(|| VerifierError::Comparator(format!("no direction in {:?}", text)))?;

    let direction = match direction.trim_matches(|c: char| !c.is_alphabetic()) {
        "improved" => ChangeDirection::Improved,
        "unchanged" => ChangeDirection::Unchanged,
        "worsened" => ChangeDirection::Worsened,
        other => {
            return Err(VerifierError::Comparator(format!(
                "unknown direction {:?}",
                other
            )))
        }
    };

    let score_line = text
        .lines()
        .find(|line| line.trim_start().to_lowercase().starts_with("change"))
        .unwrap_or_default();
    let score = f64::from(parse_relevance_score(score_line)) / 100.0;

    Ok(VisualChange { score, direction })
}
