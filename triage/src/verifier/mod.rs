//! Proof Verifier
//!
//! Decides whether a resolution proof is good enough to resolve an issue.
//! Checks run in a fixed order and the first failure is reported:
//!
//! 1. **Freshness**: the proof must postdate the issue's last assignment
//!    (`StaleProof`).
//! 2. **Location**: the proof must be taken within tolerance of the issue's
//!    canonical location (`LocationMismatch`).
//! 3. **Visual change**: the external comparator must report a meaningful
//!    improvement between before- and after-image (`NoVisibleChange`).
//!
//! A rejection is a [`Verdict`], not an error. Errors are reserved for
//! proofs that cannot be judged at all (unusable image, comparator down).

pub mod comparator;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use comparator::{ChangeDirection, HttpComparatorConfig, HttpImageComparator, ImageComparator, VisualChange};

use crate::config::TriageConfig;
use crate::model::{ImageRejection, Issue, ResolutionProof};

/// Why a proof was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    StaleProof,
    LocationMismatch,
    NoVisibleChange,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::StaleProof => "STALE_PROOF",
            Self::LocationMismatch => "LOCATION_MISMATCH",
            Self::NoVisibleChange => "NO_VISIBLE_CHANGE",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A rejection with a human-readable explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

/// Outcome of proof verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted { change: VisualChange },
    Rejected(Rejection),
}

impl Verdict {
    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self::Rejected(Rejection {
            reason,
            detail: detail.into(),
        })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(r) => Some(r.reason),
            Self::Accepted { .. } => None,
        }
    }
}

/// Proofs that cannot be judged
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifierError {
    #[error("Invalid proof image: {0}")]
    InvalidImage(#[from] ImageRejection),

    #[error("Visual comparison timed out after {0:?}")]
    Timeout(Duration),

    #[error("Visual comparison failed: {0}")]
    Comparator(String),
}

pub type VerifierResult<T> = Result<T, VerifierError>;

/// Runs the ordered proof checks
#[derive(Clone)]
pub struct ProofVerifier {
    comparator: Arc<dyn ImageComparator>,
}

impl ProofVerifier {
    pub fn new(comparator: Arc<dyn ImageComparator>) -> Self {
        Self { comparator }
    }

    /// The freshness and location checks, which need no external call.
    ///
    /// Returns the first failing check, if any.
    pub fn precheck(issue: &Issue, proof: &ResolutionProof, config: &TriageConfig) -> Option<Rejection> {
        let assigned_at = issue.assigned_at.unwrap_or(issue.created_at);
        if proof.submitted_at <= assigned_at {
            return Some(Rejection {
                reason: RejectReason::StaleProof,
                detail: format!(
                    "proof taken at {} is not after assignment at {}",
                    proof.submitted_at, assigned_at
                ),
            });
        }

        let tolerance = config.proof.location_tolerance_m;
        match &issue.location {
            Some(centroid) => {
                let distance = centroid.point.distance_m(&proof.location);
                debug!(issue_id = %issue.id, distance_m = distance, tolerance_m = tolerance, "Proof location check");
                if distance > tolerance {
                    return Some(Rejection {
                        reason: RejectReason::LocationMismatch,
                        detail: format!(
                            "proof taken {:.0} m from the issue (tolerance {:.0} m)",
                            distance, tolerance
                        ),
                    });
                }
            }
            None => warn!(issue_id = %issue.id, "Issue has no location; skipping proof location check"),
        }
        None
    }

    /// Judge a proof against the issue it targets.
    ///
    /// The comparator is only consulted when the cheap checks pass, and is
    /// bounded by `proof.compare_timeout_ms`. There is no retry.
    pub async fn verify(
        &self,
        issue: &Issue,
        proof: &ResolutionProof,
        config: &TriageConfig,
    ) -> VerifierResult<Verdict> {
        if let Some(rejection) = Self::precheck(issue, proof, config) {
            return Ok(Verdict::Rejected(rejection));
        }

        config.intake.image.validate(&proof.after_image)?;

        let timeout = Duration::from_millis(config.proof.compare_timeout_ms);
        let change = match tokio::time::timeout(
            timeout,
            self.comparator
                .compare(issue.before_image.as_ref(), &proof.after_image),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(VerifierError::Timeout(timeout)),
        };
        debug!(
            issue_id = %issue.id,
            score = change.score,
            direction = ?change.direction,
            "Visual comparison"
        );

        let min_change = config.proof.min_visual_change;
        if change.direction != ChangeDirection::Improved || change.score < min_change {
            return Ok(Verdict::reject(
                RejectReason::NoVisibleChange,
                format!(
                    "visual change {:.2} ({:?}) below required {:.2} improvement",
                    change.score, change.direction, min_change
                ),
            ));
        }

        Ok(Verdict::Accepted { change })
    }
}

impl std::fmt::Debug for ProofVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofVerifier")
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Signature;
    use crate::model::{Category, Centroid, FeedbackTally, GeoPoint, ImageRef, ReportedLocation, Severity};
    use crate::registry::IssueState;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Stub {
        change: VisualChange,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(score: f64, direction: ChangeDirection) -> Arc<Self> {
            Arc::new(Self {
                change: VisualChange { score, direction },
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageComparator for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn compare(
            &self,
            _before: Option<&ImageRef>,
            _after: &ImageRef,
        ) -> VerifierResult<VisualChange> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.change.clone())
        }
    }

    struct Hung;

    #[async_trait]
    impl ImageComparator for Hung {
        fn name(&self) -> &str {
            "hung"
        }

        async fn compare(
            &self,
            _before: Option<&ImageRef>,
            _after: &ImageRef,
        ) -> VerifierResult<VisualChange> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(VerifierError::Comparator("unreachable".into()))
        }
    }

    fn issue() -> Issue {
        let now = Utc::now();
        Issue {
            id: "issue-1".into(),
            seq: 1,
            category: Category::new("pothole"),
            location: Some(Centroid::from_location(&ReportedLocation::new(GeoPoint::new(
                12.90, 77.60,
            )))),
            jurisdiction: None,
            severity: Severity::new(2).unwrap(),
            reports: vec!["r1".into()],
            signature: Signature::from_text("pothole"),
            summary: "pothole".into(),
            department: "roads".into(),
            state: IssueState::InProgress,
            sla_deadline: now + ChronoDuration::hours(120),
            feedback: FeedbackTally::default(),
            before_image: Some(ImageRef::new("before.jpg")),
            assigned_at: Some(now),
            accepted_proof: None,
            closes_at: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn proof(issue: &Issue, offset: ChronoDuration, lat: f64, lon: f64, uri: &str) -> ResolutionProof {
        ResolutionProof {
            issue_id: issue.id.clone(),
            after_image: ImageRef::new(uri),
            submitted_at: issue.assigned_at.unwrap() + offset,
            location: GeoPoint::new(lat, lon),
            department_id: "roads".into(),
        }
    }

    #[tokio::test]
    async fn test_accepts_valid_proof() {
        let config = TriageConfig::default();
        let verifier = ProofVerifier::new(Stub::new(0.8, ChangeDirection::Improved));
        let issue = issue();
        let p = proof(&issue, ChronoDuration::hours(1), 12.9001, 77.6001, "after.jpg");
        assert!(verifier.verify(&issue, &p, &config).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_stale_proof_checked_before_anything_else() {
        let config = TriageConfig::default();
        let stub = Stub::new(0.9, ChangeDirection::Improved);
        let verifier = ProofVerifier::new(stub.clone());
        let issue = issue();
        // Wrong place and an unusable image too; staleness still wins
        let p = proof(&issue, ChronoDuration::minutes(-5), 13.5, 78.0, "after.bmp");
        let verdict = verifier.verify(&issue, &p, &config).await.unwrap();
        assert_eq!(verdict.reject_reason(), Some(RejectReason::StaleProof));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_same_instant_as_assignment_is_stale() {
        let config = TriageConfig::default();
        let verifier = ProofVerifier::new(Stub::new(0.9, ChangeDirection::Improved));
        let issue = issue();
        let p = proof(&issue, ChronoDuration::zero(), 12.90, 77.60, "after.jpg");
        let verdict = verifier.verify(&issue, &p, &config).await.unwrap();
        assert_eq!(verdict.reject_reason(), Some(RejectReason::StaleProof));
    }

    #[tokio::test]
    async fn test_location_mismatch() {
        let config = TriageConfig::default();
        let verifier = ProofVerifier::new(Stub::new(0.9, ChangeDirection::Improved));
        let issue = issue();
        let p = proof(&issue, ChronoDuration::hours(1), 12.91, 77.60, "after.jpg");
        let verdict = verifier.verify(&issue, &p, &config).await.unwrap();
        assert_eq!(verdict.reject_reason(), Some(RejectReason::LocationMismatch));
    }

    #[tokio::test]
    async fn test_no_visible_change() {
        let config = TriageConfig::default();
        let issue = issue();
        let p = proof(&issue, ChronoDuration::hours(1), 12.90, 77.60, "after.jpg");

        let weak = ProofVerifier::new(Stub::new(0.05, ChangeDirection::Improved));
        let verdict = weak.verify(&issue, &p, &config).await.unwrap();
        assert_eq!(verdict.reject_reason(), Some(RejectReason::NoVisibleChange));

        let worse = ProofVerifier::new(Stub::new(0.9, ChangeDirection::Worsened));
        let verdict = worse.verify(&issue, &p, &config).await.unwrap();
        assert_eq!(verdict.reject_reason(), Some(RejectReason::NoVisibleChange));
    }

    #[tokio::test]
    async fn test_invalid_image_is_an_error() {
        let config = TriageConfig::default();
        let verifier = ProofVerifier::new(Stub::new(0.9, ChangeDirection::Improved));
        let issue = issue();
        let p = proof(&issue, ChronoDuration::hours(1), 12.90, 77.60, "after.exe");
        let err = verifier.verify(&issue, &p, &config).await.unwrap_err();
        assert!(matches!(err, VerifierError::InvalidImage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_comparator_timeout() {
        let mut config = TriageConfig::default();
        config.proof.compare_timeout_ms = 100;
        let verifier = ProofVerifier::new(Arc::new(Hung));
        let issue = issue();
        let p = proof(&issue, ChronoDuration::hours(1), 12.90, 77.60, "after.jpg");
        let err = verifier.verify(&issue, &p, &config).await.unwrap_err();
        assert_eq!(err, VerifierError::Timeout(Duration::from_millis(100)));
    }
}
