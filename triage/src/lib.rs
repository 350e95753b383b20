//! Civic Issue Intake & Triage Engine
//!
//! This library takes raw citizen reports (free text, optional image, rough
//! location) and turns them into a deduplicated, scored, routed set of
//! issues whose lifecycle ends only with a verified resolution proof.
//!
//! # Pipeline
//!
//! ```text
//! report ──▶ Classifier ──▶ Dedup Index ──▶ Severity ──▶ Routing ──▶ Registry
//!                          (merge/create)    Scorer       Table        │
//!                                                                      ▼
//! proof  ──▶ Proof Verifier ─────────────────────────────────────▶ Registry
//!                                                                      │
//!                                                               Event Bus ──▶ notifications
//! ```
//!
//! # Components
//!
//! - [`classifier`]: capability interface over external text/image models
//! - [`dedup`]: spatial grid + token-signature index of open issues
//! - [`severity`]: deterministic ordinal scoring
//! - [`routing`]: jurisdiction polygons to department queues
//! - [`registry`]: authoritative issue store and lifecycle state machine
//! - [`verifier`]: resolution proof checks
//! - [`orchestrator`]: coordinates the above and owns the consistency rules
//! - [`analytics`]: read-only dashboard queries
//! - [`feedback`]: append-only citizen feedback log and batch recalibration
//!
//! # Usage
//!
//! ```ignore
//! use triage::{ConfigHandle, TriageConfig, TriageOrchestrator};
//!
//! let config = ConfigHandle::new(TriageConfig::from_path("triage.yaml")?)?;
//! let orchestrator = TriageOrchestrator::new(config, classifier, comparator);
//!
//! let outcome = orchestrator.submit_report(input).await?;
//! println!("{} -> {}", outcome.report_id, outcome.issue_id);
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod analytics;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod events;
pub mod feedback;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod routing;
pub mod severity;
pub mod verifier;

// Re-export configuration types
pub use config::{
    CategoryConfig, ConfigError, ConfigHandle, ConfigResult, DedupConfig, IntakeConfig,
    JurisdictionConfig, LifecycleConfig, ProofConfig, RoutingConfig, SeverityConfig, SlaConfig,
    TriageConfig,
};

// Re-export data model types
pub use model::{
    AuditEntry, AuditEvent, Category, Centroid, Channel, DepartmentId, FeedbackTally, GeoPoint,
    ImagePolicy, ImageRef, ImageRejection, Issue, IssueId, Report, ReportId, ReportInput,
    ReportedLocation, ResolutionProof, Severity, UNASSIGNED_QUEUE,
};

// Re-export component types
pub use classifier::{
    Classification, Classifier, ClassifierAdapter, ClassifierError, ClassifierResult,
    HttpClassifier, HttpClassifierConfig, KeywordClassifier,
};
pub use dedup::{Candidate, DedupError, DedupIndex, SharedDedupIndex, Signature};
pub use events::{EventBus, SharedEventBus, TriageEvent};
pub use feedback::{FeedbackEntry, FeedbackError, FeedbackKind, FeedbackLog, WeightSuggestion};
pub use registry::{
    load_snapshot, save_snapshot, Actor, IssueRegistry, IssueState, RegistryError,
    RegistrySnapshot, SharedIssueRegistry, SnapshotError,
};
pub use routing::{RouteAssignment, RoutingError, RoutingTable};
pub use severity::{ScoreBreakdown, SeverityScorer};
pub use verifier::{
    ChangeDirection, HttpComparatorConfig, HttpImageComparator, ImageComparator, ProofVerifier,
    RejectReason, Rejection, Verdict, VerifierError, VisualChange,
};

// Re-export orchestration types
pub use analytics::Dashboard;
pub use orchestrator::{
    Disposition, ProofOutcome, SubmitOutcome, TriageError, TriageOrchestrator, TriageResult,
};
