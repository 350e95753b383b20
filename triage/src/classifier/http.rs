//! Chat-completions classifier
//!
//! Sends the report text (and image reference, if any) to an
//! OpenAI-compatible `/v1/chat/completions` endpoint and reads back a
//! `category:` line and a civic-relevance `score:` line (0-100).

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Classification, Classifier, ClassifierError, ClassifierResult};
use crate::config::ConfigHandle;
use crate::model::{Category, ImageRef};

/// Endpoint settings for [`HttpClassifier`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClassifierConfig {
    /// Full chat-completions URL
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    64
}

impl Default for HttpClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("TRIAGE_CLASSIFIER_URL").unwrap_or_else(|_| {
                "http://localhost:8000/v1/chat/completions".to_string()
            }),
            model: std::env::var("TRIAGE_CLASSIFIER_MODEL")
                .unwrap_or_else(|_| "civic-classifier".to_string()),
            api_key: std::env::var("TRIAGE_CLASSIFIER_API_KEY").ok(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Classifier backed by an LLM router
pub struct HttpClassifier {
    http: reqwest::Client,
    settings: HttpClassifierConfig,
    config: ConfigHandle,
}

impl HttpClassifier {
    /// The category list offered to the model is read from `config` on
    /// every call, so reloads are picked up without rebuilding the client.
    pub fn new(settings: HttpClassifierConfig, config: ConfigHandle) -> ClassifierResult<Self> {
        // The adapter enforces the real deadline; this only bounds a hung socket.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            settings,
            config,
        })
    }

    fn system_prompt(categories: &[&str]) -> String {
        format!(
            r#"You are a civic issue classifier.
Label the citizen report with exactly one category from this list:
{}

Then rate its civic relevance from 0 to 100:
- 70-100: clearly a public infrastructure or civic service problem
- 40-69: vague or only partially civic
- 0-39: personal, private, or unrelated content
If the description is too short or generic, prefer a lower score.

Respond EXACTLY in this format:
category: <category>
score: <number>"#,
            categories.join(", ")
        )
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn classify(
        &self,
        text: &str,
        image: Option<&ImageRef>,
    ) -> ClassifierResult<Classification> {
        #[derive(Serialize)]
        struct ChatMessage {
            role: String,
            content: String,
        }

        #[derive(Serialize)]
        struct ChatRequest {
            model: String,
            messages: Vec<ChatMessage>,
            max_tokens: u32,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: ResponseMessage,
        }

        #[derive(Deserialize)]
        struct ResponseMessage {
            content: Option<String>,
        }

        let config = self.config.current();
        let categories: Vec<&str> = config.categories.iter().map(|c| c.name.as_str()).collect();

        let mut user_content = format!("USER DESCRIPTION: \"{}\"", text);
        if let Some(image) = image {
            user_content.push_str(&format!("\nIMAGE: {}", image.uri));
        }

        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Self::system_prompt(&categories),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_content,
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut builder = self.http.post(&self.settings.endpoint).json(&request);
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Unavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
        let content = chat
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ClassifierError::MalformedResponse("No response".to_string()))?;

        debug!(response = %content.trim(), "Classifier raw response");

        let category = parse_category(&content).ok_or_else(|| {
            ClassifierError::MalformedResponse(format!("no category line in {:?}", content))
        })?;
        let score = parse_relevance_score(&content);
        Ok(Classification::new(category, f64::from(score) / 100.0))
    }
}

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("NUMBER_RE regex should compile"));

fn first_number(line: &str) -> Option<u32> {
    NUMBER_RE.find(line).map(|m| {
        // Overlong digit runs saturate rather than fail
        m.as_str().parse::<u64>().unwrap_or(u64::MAX).min(100) as u32
    })
}

/// Extract a 0..=100 relevance score from free-form model output.
///
/// The first line mentioning "score" that carries a number wins; otherwise
/// the first number anywhere; otherwise 0.
pub fn parse_relevance_score(text: &str) -> u32 {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines
        .iter()
        .filter(|line| line.to_lowercase().contains("score"))
        .find_map(|line| first_number(line))
        .or_else(|| lines.iter().find_map(|line| first_number(line)))
        .unwrap_or(0)
}

/// Extract the `category:` label from model output
pub fn parse_category(text: &str) -> Option<Category> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().to_lowercase() != "category" {
            return None;
        }
        let value = value
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '*');
        (!value.is_empty()).then(|| Category::new(value))
    })
}
