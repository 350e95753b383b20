//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use triage::verifier::VerifierResult;
use triage::{
    ChangeDirection, Channel, Classification, Classifier, ClassifierError, ConfigHandle, GeoPoint,
    ImageComparator, ImageRef, JurisdictionConfig, ReportInput, ReportedLocation, ResolutionProof,
    TriageConfig, TriageOrchestrator, VisualChange,
};

/// Hands out queued classifications, then falls back to labelling by the
/// first word of the text at confidence 0.6. "fail" simulates an outage.
#[derive(Default)]
pub struct Scripted {
    queue: Mutex<VecDeque<Classification>>,
}

impl Scripted {
    pub fn new(script: impl IntoIterator<Item = Classification>) -> Self {
        Self {
            queue: Mutex::new(script.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Classifier for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, text: &str, _image: Option<&ImageRef>) -> Result<Classification, ClassifierError> {
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return Ok(next);
        }
        let word = text.split_whitespace().next().unwrap_or_default();
        if word == "fail" {
            return Err(ClassifierError::Unavailable("model offline".into()));
        }
        Ok(Classification::new(word, 0.6))
    }
}

/// Returns queued visual changes, then a clear improvement
#[derive(Default)]
pub struct Judge {
    queue: Mutex<VecDeque<VisualChange>>,
}

impl Judge {
    pub fn new(script: impl IntoIterator<Item = VisualChange>) -> Self {
        Self {
            queue: Mutex::new(script.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ImageComparator for Judge {
    fn name(&self) -> &str {
        "judge"
    }

    async fn compare(&self, _before: Option<&ImageRef>, _after: &ImageRef) -> VerifierResult<VisualChange> {
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.unwrap_or(VisualChange {
            score: 0.85,
            direction: ChangeDirection::Improved,
        }))
    }
}

pub const WARD_DEPARTMENT: &str = "public-works";

/// Default policy plus one ward covering lat 12.8..13.0, lon 77.5..77.7
pub fn ward_config() -> TriageConfig {
    let mut config = TriageConfig::default();
    config.routing.jurisdictions.push(JurisdictionConfig {
        name: "ward-12".into(),
        boundary: vec![
            GeoPoint::new(12.80, 77.50),
            GeoPoint::new(12.80, 77.70),
            GeoPoint::new(13.00, 77.70),
            GeoPoint::new(13.00, 77.50),
        ],
        default_department: WARD_DEPARTMENT.into(),
        departments: BTreeMap::new(),
    });
    config
}

pub fn engine_with(classifier: Scripted, judge: Judge) -> TriageOrchestrator {
    let config = ConfigHandle::new(ward_config()).unwrap();
    TriageOrchestrator::new(config, Arc::new(classifier), Arc::new(judge))
}

pub fn engine() -> TriageOrchestrator {
    engine_with(Scripted::default(), Judge::default())
}

pub fn report(text: &str, lat: f64, lon: f64, submitter: &str) -> ReportInput {
    ReportInput {
        text: text.into(),
        image: None,
        location: Some(ReportedLocation::new(GeoPoint::new(lat, lon))),
        channel: Channel::Mobile,
        submitter_id: submitter.into(),
    }
}

pub fn proof_at(issue_id: &str, lat: f64, lon: f64, submitted_at: DateTime<Utc>) -> ResolutionProof {
    ResolutionProof {
        issue_id: issue_id.into(),
        after_image: ImageRef::new("https://img.example/after.jpg"),
        submitted_at,
        location: GeoPoint::new(lat, lon),
        department_id: WARD_DEPARTMENT.into(),
    }
}

pub fn proof(issue_id: &str, lat: f64, lon: f64) -> ResolutionProof {
    proof_at(issue_id, lat, lon, Utc::now() + chrono::Duration::seconds(5))
}

/// Tiny deterministic generator for seeded randomised tests
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }

    /// Uniform in `[0, 1)`
    pub fn unit(&mut self) -> f64 {
        (self.next_u64() % 1_000_000) as f64 / 1_000_000.0
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}
