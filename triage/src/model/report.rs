//! Citizen reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::ReportedLocation;
use super::image::ImageRef;
use super::ReportId;

/// Channel a report arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Mobile,
    Chatbot,
    Sms,
    Whatsapp,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Mobile => write!(f, "mobile"),
            Self::Chatbot => write!(f, "chatbot"),
            Self::Sms => write!(f, "sms"),
            Self::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

/// Inbound submission before the engine assigns an id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportInput {
    pub text: String,
    #[serde(default)]
    pub image: Option<ImageRef>,
    #[serde(default)]
    pub location: Option<ReportedLocation>,
    pub channel: Channel,
    pub submitter_id: String,
}

/// A single accepted citizen complaint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub text: String,
    pub image: Option<ImageRef>,
    pub location: Option<ReportedLocation>,
    pub submitted_at: DateTime<Utc>,
    pub channel: Channel,
    pub submitter_id: String,
}

impl Report {
    /// Accept an inbound submission, assigning a fresh id
    pub fn from_input(input: ReportInput, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: input.text,
            image: input.image,
            location: input.location,
            submitted_at,
            channel: input.channel,
            submitter_id: input.submitter_id,
        }
    }

    /// Content fingerprint used to recognise channel retries.
    ///
    /// Two submissions from the same submitter and channel with the same
    /// normalised text, location (to ~1 m) and image collide.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.submitter_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.channel.to_string().as_bytes());
        hasher.update(b"\x1f");
        let text = self
            .text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        hasher.update(text.as_bytes());
        hasher.update(b"\x1f");
        if let Some(loc) = &self.location {
            let lat = (loc.point.lat * 1e5).round() as i64;
            let lon = (loc.point.lon * 1e5).round() as i64;
            hasher.update(format!("{}:{}", lat, lon).as_bytes());
        }
        hasher.update(b"\x1f");
        if let Some(image) = &self.image {
            hasher.update(image.uri.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
