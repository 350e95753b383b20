//! Citizen feedback log and batch recalibration
//!
//! Feedback is appended to a log keyed by issue id and tallied on the issue.
//! It never influences scoring directly: [`recalibrate`] is an offline
//! batch step whose suggestions an operator applies through a config
//! reload.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TriageConfig;
use crate::model::{Category, FeedbackTally, Issue, IssueId};

/// Largest change to a base weight per recalibration round
pub const MAX_WEIGHT_STEP: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FeedbackKind {
    Upvote,
    /// Satisfaction rating, 1..=5
    Rating(u8),
    Comment(String),
}

impl FeedbackKind {
    pub fn validate(&self) -> Result<(), FeedbackError> {
        match self {
            Self::Rating(r) if !(1..=5).contains(r) => Err(FeedbackError::InvalidRating(*r)),
            Self::Comment(text) if text.trim().is_empty() => Err(FeedbackError::EmptyComment),
            _ => Ok(()),
        }
    }

    /// Fold into an issue's running totals
    pub fn apply(&self, tally: &mut FeedbackTally) {
        match self {
            Self::Upvote => tally.upvotes += 1,
            Self::Rating(r) => {
                tally.ratings += 1;
                tally.rating_sum += u32::from(*r);
            }
            Self::Comment(_) => tally.comments += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedbackError {
    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("Comment is empty")]
    EmptyComment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub issue_id: IssueId,
    pub submitter_id: String,
    pub kind: FeedbackKind,
    pub at: DateTime<Utc>,
}

/// Append-only feedback store
#[derive(Debug, Default)]
pub struct FeedbackLog {
    entries: RwLock<Vec<FeedbackEntry>>,
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: FeedbackEntry) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, in append order
    pub fn entries(&self) -> Vec<FeedbackEntry> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn for_issue(&self, issue_id: &str) -> Vec<FeedbackEntry> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.issue_id == issue_id)
            .cloned()
            .collect()
    }
}

/// Suggested base weight for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSuggestion {
    pub category: Category,
    pub issues: usize,
    pub mean_upvotes: f64,
    pub current: f64,
    pub suggested: f64,
}

/// Suggest new category base weights from community feedback.
///
/// Categories whose issues draw more upvotes per issue than the global mean
/// are nudged up by at most [`MAX_WEIGHT_STEP`]; those below are nudged
/// down. Results stay within `[1, 5]`. Categories with no issues keep their
/// weight.
pub fn recalibrate(
    entries: &[FeedbackEntry],
    issues: &[Arc<Issue>],
    config: &TriageConfig,
) -> Vec<WeightSuggestion> {
    let category_of: HashMap<&str, &Category> = issues
        .iter()
        .map(|issue| (issue.id.as_str(), &issue.category))
        .collect();

    let mut issue_counts: BTreeMap<&Category, usize> = BTreeMap::new();
    for issue in issues {
        *issue_counts.entry(&issue.category).or_insert(0) += 1;
    }

    let mut upvotes: BTreeMap<&Category, usize> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.kind == FeedbackKind::Upvote) {
        if let Some(category) = category_of.get(entry.issue_id.as_str()) {
            *upvotes.entry(category).or_insert(0) += 1;
        }
    }

    let total_issues: usize = issue_counts.values().sum();
    let total_upvotes: usize = upvotes.values().sum();
    let global_mean = if total_issues == 0 {
        0.0
    } else {
        total_upvotes as f64 / total_issues as f64
    };

    config
        .categories
        .iter()
        .map(|cfg| {
            let count = issue_counts.get(&cfg.name).copied().unwrap_or(0);
            let votes = upvotes.get(&cfg.name).copied().unwrap_or(0);
            let mean = if count == 0 {
                0.0
            } else {
                votes as f64 / count as f64
            };

            let step = if count == 0 || global_mean == 0.0 {
                0.0
            } else {
                ((mean - global_mean) / global_mean).clamp(-1.0, 1.0) * MAX_WEIGHT_STEP
            };

            WeightSuggestion {
                category: cfg.name.clone(),
                issues: count,
                mean_upvotes: mean,
                current: cfg.base_weight,
                suggested: (cfg.base_weight + step).clamp(1.0, 5.0),
            }
        })
        .collect()
}
