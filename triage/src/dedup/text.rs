//! Token signatures for textual similarity
//!
//! Report text is reduced to a set of normalised content tokens: lowercase,
//! punctuation stripped, stopwords dropped, common street abbreviations
//! expanded and simple plurals folded. Similarity between two signatures is
//! the overlap coefficient `|A ∩ B| / min(|A|, |B|)`, which tolerates a
//! terse report matching a verbose one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Upper bound on tokens an issue signature accumulates across merges
pub const MAX_SIGNATURE_TOKENS: usize = 48;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "been", "by", "for", "from", "has", "have", "here", "i",
    "in", "is", "it", "its", "me", "my", "near", "no", "not", "of", "on", "opp", "opposite", "or",
    "our", "please", "same", "so", "that", "the", "there", "this", "to", "very", "was", "we",
    "with",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("st", "street"),
    ("rd", "road"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("ln", "lane"),
    ("blvd", "boulevard"),
    ("jn", "junction"),
    ("jct", "junction"),
    ("hwy", "highway"),
    ("bldg", "building"),
];

fn normalize_token(raw: &str) -> Option<String> {
    let token: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    if token.is_empty() || STOPWORDS.contains(&token.as_str()) {
        return None;
    }
    if let Some((_, full)) = ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == token) {
        return Some(full.to_string());
    }
    if token.len() > 4 && token.ends_with('s') && !token.ends_with("ss") {
        return Some(token[..token.len() - 1].to_string());
    }
    Some(token)
}

/// Normalised token set of a text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(BTreeSet<String>);

impl Signature {
    /// Tokenise free text
    pub fn from_text(text: &str) -> Self {
        Self(
            text.split(|c: char| c.is_whitespace() || c == ',' || c == '/' || c == '-')
                .filter_map(normalize_token)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Overlap coefficient in `[0, 1]`; empty signatures match nothing
    pub fn similarity(&self, other: &Signature) -> f64 {
        let smaller = self.len().min(other.len());
        if smaller == 0 {
            return 0.0;
        }
        let shared = self.0.intersection(&other.0).count();
        shared as f64 / smaller as f64
    }

    /// Union of two signatures, capped at [`MAX_SIGNATURE_TOKENS`].
    ///
    /// The cap keeps the lexicographically smallest tokens so the result
    /// does not depend on which side came first.
    pub fn union(&self, other: &Signature) -> Signature {
        Signature(
            self.0
                .union(&other.0)
                .take(MAX_SIGNATURE_TOKENS)
                .cloned()
                .collect(),
        )
    }
}
