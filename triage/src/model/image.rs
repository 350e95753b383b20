//! Image references and the intake image gate
//!
//! Images themselves live in external storage; the engine only sees a
//! reference plus whatever dimension metadata the upload channel supplied.

use serde::{Deserialize, Serialize};

/// Reference to an externally stored image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Storage URI or path
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ImageRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Lowercased file extension, ignoring any query string or fragment
    pub fn extension(&self) -> Option<String> {
        let path = self.uri.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        let (stem, ext) = file.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_lowercase())
    }
}

/// Why an image failed the intake gate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageRejection {
    #[error("invalid file type: {0}")]
    InvalidType(String),

    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },

    #[error("image too large: {width}x{height}")]
    TooLarge { width: u32, height: u32 },
}

/// Acceptance rules for uploaded images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePolicy {
    pub allowed_extensions: Vec<String>,
    /// Minimum width and height in pixels
    pub min_dimension: u32,
    /// Maximum width and height in pixels
    pub max_dimension: u32,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: ["png", "jpg", "jpeg", "gif", "webp"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            min_dimension: 100,
            max_dimension: 4000,
        }
    }
}

impl ImagePolicy {
    /// Check an image against the policy.
    ///
    /// Unknown dimensions are not held against the image; only the type is
    /// mandatory.
    pub fn validate(&self, image: &ImageRef) -> Result<(), ImageRejection> {
        let ext = image
            .extension()
            .ok_or_else(|| ImageRejection::InvalidType(image.uri.clone()))?;
        if !self.allowed_extensions.iter().any(|allowed| allowed == &ext) {
            return Err(ImageRejection::InvalidType(ext));
        }

        if let (Some(width), Some(height)) = (image.width, image.height) {
            if width < self.min_dimension || height < self.min_dimension {
                return Err(ImageRejection::TooSmall { width, height });
            }
            if width > self.max_dimension || height > self.max_dimension {
                return Err(ImageRejection::TooLarge { width, height });
            }
        }

        Ok(())
    }
}
