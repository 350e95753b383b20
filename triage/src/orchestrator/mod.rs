//! Triage Orchestrator
//!
//! Coordinates the classifier, dedup index, scorer, routing table, registry
//! and proof verifier for every incoming report and resolution proof, and
//! owns the consistency rules between them.
//!
//! # Locking
//!
//! Two kinds of lock are ever held together, always in this order:
//!
//! 1. the striped cell locks covering a report's grid neighbourhood
//!    ([`CellLocks`]), which serialise merge-or-create decisions between
//!    reports that could land on the same issue;
//! 2. the per-issue gate ([`IssueRegistry::lock`]), which serialises every
//!    mutation of one issue.
//!
//! External calls (classification, visual comparison) run with no lock
//! held. Index records of an issue are only written while its gate is
//! held, so the index never disagrees with the registry for longer than one
//! critical section.
//!
//! Events are published after the locks are released.

pub mod error;
pub mod locks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use error::{TriageError, TriageResult};
pub use locks::{CellGuard, CellLocks};

use crate::analytics::Dashboard;
use crate::classifier::{Classification, Classifier, ClassifierAdapter, ClassifierError};
use crate::config::{ConfigHandle, TriageConfig};
use crate::dedup::{DedupIndex, SharedDedupIndex, Signature};
use crate::events::{EventBus, SharedEventBus, TriageEvent};
use crate::feedback::{recalibrate, FeedbackEntry, FeedbackKind, FeedbackLog, WeightSuggestion};
use crate::model::{
    AuditEntry, AuditEvent, Category, Centroid, DepartmentId, Issue, IssueId, Report, ReportId,
    ReportInput, ResolutionProof, Severity,
};
use crate::registry::{
    apply_transition, Actor, IssueRegistry, IssueState, RegistryError, RegistrySnapshot,
    SharedIssueRegistry,
};
use crate::routing::{RouteAssignment, RoutingTable};
use crate::severity::SeverityScorer;
use crate::verifier::{ImageComparator, ProofVerifier, Verdict};

/// How a report was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Created,
    Merged,
    ManualReview,
}

/// Result of submitting a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub report_id: ReportId,
    pub issue_id: IssueId,
    pub disposition: Disposition,
    pub severity: Severity,
    pub department: DepartmentId,
    pub state: IssueState,
    pub contributors: usize,
    /// Degraded-path notes (stripped image, no jurisdiction, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SubmitOutcome {
    fn new(report_id: ReportId, issue: &Issue, disposition: Disposition, warnings: Vec<String>) -> Self {
        Self {
            report_id,
            issue_id: issue.id.clone(),
            disposition,
            severity: issue.severity,
            department: issue.department.clone(),
            state: issue.state,
            contributors: issue.contributor_count(),
            warnings,
        }
    }
}

/// Result of submitting a resolution proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofOutcome {
    pub issue_id: IssueId,
    pub verdict: Verdict,
    /// Issue state after the verdict was applied
    pub state: IssueState,
}

impl ProofOutcome {
    pub fn is_accepted(&self) -> bool {
        self.verdict.is_accepted()
    }
}

/// The triage engine
pub struct TriageOrchestrator {
    config: ConfigHandle,
    classifier: ClassifierAdapter,
    verifier: ProofVerifier,
    registry: SharedIssueRegistry,
    index: SharedDedupIndex,
    cells: CellLocks,
    events: SharedEventBus,
    feedback: FeedbackLog,
}

impl TriageOrchestrator {
    pub fn new(
        config: ConfigHandle,
        classifier: Arc<dyn Classifier>,
        comparator: Arc<dyn ImageComparator>,
    ) -> Self {
        Self::with_registry(config, classifier, comparator, IssueRegistry::new())
    }

    fn with_registry(
        config: ConfigHandle,
        classifier: Arc<dyn Classifier>,
        comparator: Arc<dyn ImageComparator>,
        registry: IssueRegistry,
    ) -> Self {
        let cell_size = config.current().dedup.radius_m;
        Self {
            config,
            classifier: ClassifierAdapter::new(classifier),
            verifier: ProofVerifier::new(comparator),
            registry: registry.shared(),
            index: DedupIndex::new(cell_size).shared(),
            cells: CellLocks::default(),
            events: EventBus::new().shared(),
            feedback: FeedbackLog::new(),
        }
    }

    /// Rebuild an engine from a registry snapshot; the dedup index is
    /// reconstructed from the restored issues.
    pub fn restore(
        config: ConfigHandle,
        classifier: Arc<dyn Classifier>,
        comparator: Arc<dyn ImageComparator>,
        snapshot: RegistrySnapshot,
    ) -> TriageResult<Self> {
        let registry = IssueRegistry::restore(snapshot)?;
        let orchestrator = Self::with_registry(config, classifier, comparator, registry);
        let indexed = orchestrator.rebuild_index()?;
        info!(
            issues = orchestrator.registry.len(),
            indexed, "Triage engine restored from snapshot"
        );
        Ok(orchestrator)
    }

    /// Publish events on the given bus instead of a private one
    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn registry(&self) -> &SharedIssueRegistry {
        &self.registry
    }

    pub fn index(&self) -> &SharedDedupIndex {
        &self.index
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn feedback_log(&self) -> &FeedbackLog {
        &self.feedback
    }

    /// Point-in-time copy of the registry for persistence
    pub fn snapshot(&self) -> TriageResult<RegistrySnapshot> {
        Ok(self.registry.snapshot()?)
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Accept a citizen submission
    pub async fn submit_report(&self, input: ReportInput) -> TriageResult<SubmitOutcome> {
        self.submit(Report::from_input(input, Utc::now())).await
    }

    /// Triage one report into exactly one disposition: merged into an
    /// existing issue, a new issue, or a manual-review issue.
    pub async fn submit(&self, mut report: Report) -> TriageResult<SubmitOutcome> {
        let config = self.config.current();

        if report.text.trim().is_empty() && report.image.is_none() {
            return Err(TriageError::validation("report has neither text nor image"));
        }
        if report.submitter_id.trim().is_empty() {
            return Err(TriageError::validation("submitter_id is required"));
        }

        let warnings = Self::sanitize(&mut report, &config);
        self.check_unclaimed(&report)?;

        let classification = self
            .classifier
            .classify(&report.text, report.image.as_ref(), &config)
            .await;

        match classification {
            Ok(classification) => self.place(report, classification, &config, warnings).await,
            Err(err) => self.queue_for_review(report, err, &config, warnings),
        }
    }

    /// Strip unusable attachments; the report itself is always kept
    fn sanitize(report: &mut Report, config: &TriageConfig) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(image) = &report.image {
            if let Err(rejection) = config.intake.image.validate(image) {
                warn!(report_id = %report.id, %rejection, "Stripping invalid report image");
                warnings.push(format!("image ignored: {}", rejection));
                report.image = None;
            }
        }
        if let Some(location) = &report.location {
            if !location.point.is_valid() {
                warn!(report_id = %report.id, location = %location.point, "Stripping invalid report location");
                warnings.push(format!("location ignored: {} is not a valid coordinate", location.point));
                report.location = None;
            }
        }
        warnings
    }

    fn check_unclaimed(&self, report: &Report) -> TriageResult<()> {
        let owner = self
            .registry
            .owner_of(&report.id)
            .or_else(|| self.registry.owner_of_fingerprint(&report.fingerprint()));
        match owner {
            Some(issue_id) => Err(TriageError::ReportAlreadyAccepted {
                report_id: report.id.clone(),
                issue_id,
            }),
            None => Ok(()),
        }
    }

    /// Merge-or-create for a classified report
    async fn place(
        &self,
        report: Report,
        classification: Classification,
        config: &TriageConfig,
        warnings: Vec<String>,
    ) -> TriageResult<SubmitOutcome> {
        let severity = SeverityScorer::new(config).score(
            &classification.category,
            classification.confidence,
            classification.visual_severity,
        );
        let signature = Signature::from_text(&report.text);

        let Some(location) = report.location else {
            debug!(report_id = %report.id, "Report has no location; skipping dedup");
            return self.create(report, classification.category, severity, signature, config, warnings);
        };

        let neighbourhood = self
            .index
            .grid()
            .neighbourhood(&location.point, config.dedup.radius_m);
        let _cells = self.cells.acquire_around(&neighbourhood).await;

        let categories = config.compatible_categories(&classification.category);
        let candidates = self
            .index
            .query(&location.point, &categories, &signature, &config.dedup)?;

        let threshold = config.dedup.merge_threshold;
        for candidate in candidates.iter().filter(|c| c.score > threshold) {
            let mut guard = match self.registry.lock(&candidate.issue_id).await {
                Ok(guard) => guard,
                Err(RegistryError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let merged = match guard.merge_report(&report, severity, &signature, config, Utc::now()) {
                Ok(merged) => merged,
                Err(RegistryError::WrongState { state, .. } | RegistryError::AlreadyTerminal { state, .. }) => {
                    debug!(
                        issue_id = %candidate.issue_id,
                        %state,
                        "Candidate no longer accepts merges"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let issue = merged.issue.clone();
            self.index_issue(&issue)?;
            drop(guard);

            info!(
                issue_id = %issue.id,
                report_id = %report.id,
                score = candidate.score,
                distance_m = candidate.distance_m,
                contributors = issue.contributor_count(),
                severity = %issue.severity,
                "Report merged into existing issue"
            );
            self.events.publish(TriageEvent::IssueMerged {
                issue_id: issue.id.clone(),
                report_id: report.id.clone(),
                contributors: issue.contributor_count(),
                severity_before: merged.severity_before,
                severity_after: issue.severity,
                timestamp: issue.updated_at,
            });
            return Ok(SubmitOutcome::new(report.id, &issue, Disposition::Merged, warnings));
        }

        // Still holding the cell locks: no concurrent report in this
        // neighbourhood can create a competing issue.
        self.create(report, classification.category, severity, signature, config, warnings)
    }

    fn create(
        &self,
        report: Report,
        category: Category,
        severity: Severity,
        signature: Signature,
        config: &TriageConfig,
        mut warnings: Vec<String>,
    ) -> TriageResult<SubmitOutcome> {
        let now = Utc::now();
        let route = self.route(&category, &report, config, &mut warnings);

        let mut issue = Issue {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.registry.next_seq(),
            location: report.location.as_ref().map(Centroid::from_location),
            jurisdiction: route.jurisdiction.clone(),
            severity,
            reports: vec![report.id.clone()],
            signature,
            summary: report.text.clone(),
            department: route.department.clone(),
            state: IssueState::Open,
            sla_deadline: now + config.sla_for(&category, severity),
            feedback: Default::default(),
            before_image: report.image.clone(),
            assigned_at: None,
            accepted_proof: None,
            closes_at: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
            category,
        };
        if !route.is_unassigned() {
            apply_transition(&mut issue, IssueState::Assigned, Actor::System, None, now)?;
            issue.assigned_at = Some(now);
        }

        let issue = self.registry.insert(issue, &report)?;
        self.index_issue(&issue)?;

        info!(
            issue_id = %issue.id,
            report_id = %report.id,
            category = %issue.category,
            severity = %issue.severity,
            department = %issue.department,
            "New issue created"
        );
        self.events.publish(TriageEvent::IssueCreated {
            issue_id: issue.id.clone(),
            report_id: report.id.clone(),
            category: issue.category.clone(),
            severity: issue.severity,
            department: issue.department.clone(),
            timestamp: now,
        });
        if issue.state == IssueState::Assigned {
            self.events.publish(TriageEvent::IssueAssigned {
                issue_id: issue.id.clone(),
                department: issue.department.clone(),
                timestamp: now,
            });
        }

        Ok(SubmitOutcome::new(report.id, &issue, Disposition::Created, warnings))
    }

    fn route(
        &self,
        category: &Category,
        report: &Report,
        config: &TriageConfig,
        warnings: &mut Vec<String>,
    ) -> RouteAssignment {
        let location = report.location.as_ref().map(|l| &l.point);
        match RoutingTable::from_config(config).route(category, location) {
            Ok(route) => route,
            Err(e) => {
                warn!(report_id = %report.id, %category, error = %e, "Routing to unassigned queue");
                warnings.push(format!("routed to unassigned queue: {}", e));
                RouteAssignment::unassigned()
            }
        }
    }

    fn queue_for_review(
        &self,
        report: Report,
        cause: ClassifierError,
        config: &TriageConfig,
        warnings: Vec<String>,
    ) -> TriageResult<SubmitOutcome> {
        let now = Utc::now();
        let category = Category::unclassified();
        let severity = Severity::MIN;

        let issue = Issue {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.registry.next_seq(),
            location: report.location.as_ref().map(Centroid::from_location),
            jurisdiction: None,
            severity,
            reports: vec![report.id.clone()],
            signature: Signature::from_text(&report.text),
            summary: report.text.clone(),
            department: RouteAssignment::unassigned().department,
            state: IssueState::ManualReview,
            sla_deadline: now + config.sla_for(&category, severity),
            feedback: Default::default(),
            before_image: report.image.clone(),
            assigned_at: None,
            accepted_proof: None,
            closes_at: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
            category,
        };
        let issue = self.registry.insert(issue, &report)?;

        warn!(
            issue_id = %issue.id,
            report_id = %report.id,
            cause = %cause,
            "Classification failed; report queued for manual review"
        );
        self.events.publish(TriageEvent::ReportQueuedForReview {
            issue_id: issue.id.clone(),
            report_id: report.id.clone(),
            cause: cause.to_string(),
            timestamp: now,
        });

        Ok(SubmitOutcome::new(report.id, &issue, Disposition::ManualReview, warnings))
    }

    /// Label a manual-review issue and release it into the normal flow
    pub async fn resolve_manual_review(
        &self,
        issue_id: &str,
        category: impl Into<Category>,
        actor: Actor,
    ) -> TriageResult<Arc<Issue>> {
        let config = self.config.current();
        let category = category.into();
        if !config.is_known_category(&category) {
            return Err(TriageError::UnknownCategory(category));
        }

        let issue = self.registry.get(issue_id)?;
        Self::expect_state(&issue, &[IssueState::ManualReview], "manual_review")?;

        let _cells = match &issue.location {
            Some(centroid) => {
                let cells = self
                    .index
                    .grid()
                    .neighbourhood(&centroid.point, config.dedup.radius_m);
                Some(self.cells.acquire_around(&cells).await)
            }
            None => None,
        };
        let mut guard = self.registry.lock(issue_id).await?;
        let current = guard.issue()?;
        Self::expect_state(&current, &[IssueState::ManualReview], "manual_review")?;

        // An operator label is taken at full confidence
        let severity = SeverityScorer::new(&config).score(&category, 1.0, None);
        let location = issue.location.map(|c| c.point);
        let route = match RoutingTable::from_config(&config).route(&category, location.as_ref()) {
            Ok(route) => route,
            Err(e) => {
                warn!(issue_id, %category, error = %e, "Routing to unassigned queue");
                RouteAssignment::unassigned()
            }
        };

        let now = Utc::now();
        let updated = guard.update(now, |draft| {
            draft.category = category.clone();
            draft.severity = severity;
            draft.department = route.department.clone();
            draft.jurisdiction = route.jurisdiction.clone();
            draft.sla_deadline = draft.created_at + config.sla_for(&category, severity);
            apply_transition(draft, IssueState::Open, actor.clone(), None, now)?;
            if !route.is_unassigned() {
                apply_transition(draft, IssueState::Assigned, actor.clone(), None, now)?;
                draft.assigned_at = Some(now);
            }
            Ok(())
        })?;
        self.index_issue(&updated)?;
        drop(guard);

        info!(
            issue_id,
            %category,
            severity = %updated.severity,
            department = %updated.department,
            actor = %actor,
            "Manual review resolved"
        );
        self.events.publish(TriageEvent::IssueCreated {
            issue_id: updated.id.clone(),
            report_id: updated.reports[0].clone(),
            category: updated.category.clone(),
            severity: updated.severity,
            department: updated.department.clone(),
            timestamp: now,
        });
        if updated.state == IssueState::Assigned {
            self.events.publish(TriageEvent::IssueAssigned {
                issue_id: updated.id.clone(),
                department: updated.department.clone(),
                timestamp: now,
            });
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Resolution proofs
    // ------------------------------------------------------------------

    /// Verify a resolution proof and apply the verdict.
    ///
    /// Accepted: the issue becomes Resolved and closure is scheduled after
    /// the grace period. Rejected: the issue passes through Disputed back
    /// to InProgress and the reason is returned. Unjudgeable proofs (bad
    /// image, comparator down) are errors and leave the issue untouched.
    pub async fn submit_proof(&self, proof: ResolutionProof) -> TriageResult<ProofOutcome> {
        let config = self.config.current();
        let issue = self.registry.get(&proof.issue_id)?;
        Self::expect_proof_state(&issue)?;

        let verdict = self.verifier.verify(&issue, &proof, &config).await?;

        let mut guard = self.registry.lock(&proof.issue_id).await?;
        let current = guard.issue()?;
        Self::expect_proof_state(&current)?;

        // The issue may have been reassigned or merged into while the
        // comparator ran
        let verdict = match ProofVerifier::precheck(&current, &proof, &config) {
            Some(rejection) if verdict.is_accepted() => Verdict::Rejected(rejection),
            _ => verdict,
        };

        let now = Utc::now();
        let department = Actor::Department(proof.department_id.clone());
        match &verdict {
            Verdict::Accepted { change } => {
                let grace = chrono::Duration::seconds(config.lifecycle.closure_grace_secs as i64);
                let closes_at = now + grace;
                let updated = guard.update(now, |draft| {
                    draft.accepted_proof = Some(proof.clone());
                    draft.closes_at = Some(closes_at);
                    apply_transition(draft, IssueState::Resolved, department.clone(), None, now)
                })?;
                self.index.remove(&updated.id)?;
                drop(guard);

                info!(
                    issue_id = %updated.id,
                    department = %proof.department_id,
                    change = change.score,
                    %closes_at,
                    "Resolution proof accepted"
                );
                self.events.publish(TriageEvent::IssueResolved {
                    issue_id: updated.id.clone(),
                    department: proof.department_id.clone(),
                    closes_at,
                    timestamp: now,
                });
                Ok(ProofOutcome {
                    issue_id: updated.id.clone(),
                    verdict: verdict.clone(),
                    state: updated.state,
                })
            }
            Verdict::Rejected(rejection) => {
                let updated = guard.update(now, |draft| {
                    apply_transition(
                        draft,
                        IssueState::Disputed,
                        department.clone(),
                        Some(rejection.detail.clone()),
                        now,
                    )?;
                    apply_transition(
                        draft,
                        IssueState::InProgress,
                        Actor::System,
                        Some(rejection.reason.code().to_string()),
                        now,
                    )
                })?;
                drop(guard);

                info!(
                    issue_id = %updated.id,
                    department = %proof.department_id,
                    reason = %rejection.reason,
                    detail = %rejection.detail,
                    "Resolution proof rejected"
                );
                self.events.publish(TriageEvent::IssueDisputed {
                    issue_id: updated.id.clone(),
                    reason: Some(rejection.reason),
                    detail: rejection.detail.clone(),
                    actor: department,
                    timestamp: now,
                });
                Ok(ProofOutcome {
                    issue_id: updated.id.clone(),
                    verdict: verdict.clone(),
                    state: updated.state,
                })
            }
        }
    }

    /// Contest an accepted resolution before it closes
    pub async fn dispute_resolution(
        &self,
        issue_id: &str,
        actor: Actor,
        reason: impl Into<String>,
    ) -> TriageResult<Arc<Issue>> {
        let config = self.config.current();
        let reason = reason.into();
        let issue = self.registry.get(issue_id)?;
        Self::expect_state(&issue, &[IssueState::Resolved], "resolved")?;

        let _cells = match &issue.location {
            Some(centroid) => {
                let cells = self
                    .index
                    .grid()
                    .neighbourhood(&centroid.point, config.dedup.radius_m);
                Some(self.cells.acquire_around(&cells).await)
            }
            None => None,
        };
        let mut guard = self.registry.lock(issue_id).await?;
        let current = guard.issue()?;
        Self::expect_state(&current, &[IssueState::Resolved], "resolved")?;

        let now = Utc::now();
        let updated = guard.update(now, |draft| {
            apply_transition(draft, IssueState::Disputed, actor.clone(), Some(reason.clone()), now)?;
            apply_transition(draft, IssueState::InProgress, Actor::System, None, now)?;
            draft.accepted_proof = None;
            draft.closes_at = None;
            Ok(())
        })?;
        self.index_issue(&updated)?;
        drop(guard);

        info!(issue_id, actor = %actor, %reason, "Resolution disputed");
        self.events.publish(TriageEvent::IssueDisputed {
            issue_id: updated.id.clone(),
            reason: None,
            detail: reason,
            actor,
            timestamp: now,
        });
        Ok(updated)
    }

    /// Close every resolved issue whose grace period has elapsed
    pub async fn close_due(&self, now: DateTime<Utc>) -> TriageResult<Vec<IssueId>> {
        let due: Vec<IssueId> = self
            .registry
            .all()?
            .into_iter()
            .filter(|issue| Self::is_due(issue, now))
            .map(|issue| issue.id.clone())
            .collect();

        let mut closed = Vec::with_capacity(due.len());
        for issue_id in due {
            let mut guard = self.registry.lock(&issue_id).await?;
            let current = guard.issue()?;
            if !Self::is_due(&current, now) {
                continue;
            }
            guard.transition(IssueState::Closed, Actor::System, None, now)?;
            drop(guard);

            info!(issue_id = %issue_id, "Issue closed");
            self.events.publish(TriageEvent::IssueClosed {
                issue_id: issue_id.clone(),
                timestamp: now,
            });
            closed.push(issue_id);
        }
        Ok(closed)
    }

    fn is_due(issue: &Issue, now: DateTime<Utc>) -> bool {
        issue.state == IssueState::Resolved && issue.closes_at.is_some_and(|at| at <= now)
    }

    // ------------------------------------------------------------------
    // Department and operator actions
    // ------------------------------------------------------------------

    /// Hand an issue to a department, restarting the assignment clock
    pub async fn assign(
        &self,
        issue_id: &str,
        department: impl Into<DepartmentId>,
        actor: Actor,
    ) -> TriageResult<Arc<Issue>> {
        let department = department.into();
        if department.trim().is_empty() {
            return Err(TriageError::validation("department is required"));
        }

        let now = Utc::now();
        let mut guard = self.registry.lock(issue_id).await?;
        let updated = guard.update(now, |draft| {
            let previous = draft.department.clone();
            apply_transition(draft, IssueState::Assigned, actor.clone(), None, now)?;
            draft.assigned_at = Some(now);
            if previous != department {
                draft.audit.push(AuditEntry {
                    at: now,
                    actor: actor.clone(),
                    event: AuditEvent::Reassigned {
                        from: previous,
                        to: department.clone(),
                    },
                });
                draft.department = department.clone();
            }
            Ok(())
        })?;
        drop(guard);

        info!(issue_id, department = %updated.department, actor = %actor, "Issue assigned");
        self.events.publish(TriageEvent::IssueAssigned {
            issue_id: updated.id.clone(),
            department: updated.department.clone(),
            timestamp: now,
        });
        Ok(updated)
    }

    /// Department acknowledges and starts work
    pub async fn start_work(&self, issue_id: &str, actor: Actor) -> TriageResult<Arc<Issue>> {
        let updated = self
            .registry
            .transition(issue_id, IssueState::InProgress, actor, None, Utc::now())
            .await?;
        debug!(issue_id, "Work started");
        Ok(updated)
    }

    /// Archive an issue administratively
    pub async fn cancel(
        &self,
        issue_id: &str,
        actor: Actor,
        reason: impl Into<String>,
    ) -> TriageResult<Arc<Issue>> {
        let reason = reason.into();
        let now = Utc::now();
        let mut guard = self.registry.lock(issue_id).await?;
        let updated = guard.transition(IssueState::Cancelled, actor.clone(), Some(reason.clone()), now)?;
        self.index.remove(issue_id)?;
        drop(guard);

        info!(issue_id, actor = %actor, %reason, "Issue cancelled");
        self.events.publish(TriageEvent::IssueCancelled {
            issue_id: updated.id.clone(),
            actor,
            reason,
            timestamp: now,
        });
        Ok(updated)
    }

    /// Set severity explicitly. This is the only path on which severity may
    /// go down; the SLA deadline follows the new severity.
    pub async fn override_severity(
        &self,
        issue_id: &str,
        severity: Severity,
        actor: Actor,
        reason: impl Into<String>,
    ) -> TriageResult<Arc<Issue>> {
        let reason = reason.into();
        let config = self.config.current();
        let now = Utc::now();

        let mut guard = self.registry.lock(issue_id).await?;
        let updated = guard.update(now, |draft| {
            if draft.is_terminal() {
                return Err(RegistryError::AlreadyTerminal {
                    issue_id: draft.id.clone(),
                    state: draft.state,
                });
            }
            draft.audit.push(AuditEntry {
                at: now,
                actor: actor.clone(),
                event: AuditEvent::SeverityOverride {
                    from: draft.severity,
                    to: severity,
                    reason: reason.clone(),
                },
            });
            draft.severity = severity;
            draft.sla_deadline = draft.created_at + config.sla_for(&draft.category, severity);
            Ok(())
        })?;
        drop(guard);

        info!(issue_id, %severity, actor = %actor, %reason, "Severity overridden");
        Ok(updated)
    }

    /// Record citizen feedback. Closed and cancelled issues still accept
    /// feedback.
    pub async fn record_feedback(
        &self,
        issue_id: &str,
        submitter_id: impl Into<String>,
        kind: FeedbackKind,
    ) -> TriageResult<Arc<Issue>> {
        kind.validate()?;
        let now = Utc::now();

        let mut guard = self.registry.lock(issue_id).await?;
        let updated = guard.update(now, |draft| {
            kind.apply(&mut draft.feedback);
            Ok(())
        })?;
        self.feedback.append(FeedbackEntry {
            issue_id: issue_id.to_string(),
            submitter_id: submitter_id.into(),
            kind,
            at: now,
        });
        drop(guard);

        debug!(issue_id, upvotes = updated.feedback.upvotes, "Feedback recorded");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Read side and maintenance
    // ------------------------------------------------------------------

    /// Read-only view over a consistent snapshot of every issue
    pub fn dashboard(&self, at: DateTime<Utc>) -> TriageResult<Dashboard> {
        Ok(Dashboard::from_registry(&self.registry, at)?)
    }

    /// Suggested category weights from the feedback collected so far
    pub fn recalibrate_weights(&self) -> TriageResult<Vec<WeightSuggestion>> {
        let issues = self.registry.all()?;
        Ok(recalibrate(&self.feedback.entries(), &issues, &self.config.current()))
    }

    /// Re-derive the dedup index from the registry; returns the number of
    /// issues indexed
    pub fn rebuild_index(&self) -> TriageResult<usize> {
        self.index.clear()?;
        let mut indexed = 0;
        for issue in self.registry.all()? {
            if self.index_issue(&issue)? {
                indexed += 1;
            }
        }
        debug!(indexed, "Dedup index rebuilt");
        Ok(indexed)
    }

    /// Bring the index record of an issue in line with its published state.
    /// Callers hold the issue gate, or are the only writer.
    fn index_issue(&self, issue: &Issue) -> TriageResult<bool> {
        match (&issue.location, issue.state.accepts_merge()) {
            (Some(centroid), true) => {
                self.index.insert(
                    &issue.id,
                    issue.seq,
                    centroid.point,
                    issue.category.clone(),
                    issue.signature.clone(),
                )?;
                Ok(true)
            }
            _ => {
                self.index.remove(&issue.id)?;
                Ok(false)
            }
        }
    }

    fn expect_proof_state(issue: &Issue) -> TriageResult<()> {
        Self::expect_state(issue, &[IssueState::Assigned, IssueState::InProgress], "assigned or in_progress")
    }

    fn expect_state(issue: &Issue, allowed: &[IssueState], expected: &str) -> TriageResult<()> {
        if allowed.contains(&issue.state) {
            return Ok(());
        }
        if issue.is_terminal() {
            return Err(TriageError::AlreadyTerminal {
                issue_id: issue.id.clone(),
                state: issue.state,
            });
        }
        Err(TriageError::WrongState {
            issue_id: issue.id.clone(),
            state: issue.state,
            expected: expected.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JurisdictionConfig;
    use crate::model::{Channel, GeoPoint, ImageRef, ReportedLocation};
    use crate::verifier::{ChangeDirection, RejectReason, VerifierResult, VisualChange};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Classifies by the first word of the text; "fail" simulates an outage
    struct FirstWord;

    #[async_trait]
    impl Classifier for FirstWord {
        fn name(&self) -> &str {
            "first-word"
        }

        async fn classify(
            &self,
            text: &str,
            _image: Option<&ImageRef>,
        ) -> Result<Classification, ClassifierError> {
            let word = text.split_whitespace().next().unwrap_or_default();
            if word == "fail" {
                return Err(ClassifierError::Unavailable("model offline".into()));
            }
            Ok(Classification::new(word, 0.6))
        }
    }

    struct Fixed(ChangeDirection);

    #[async_trait]
    impl ImageComparator for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn compare(&self, _before: Option<&ImageRef>, _after: &ImageRef) -> VerifierResult<VisualChange> {
            Ok(VisualChange {
                score: 0.8,
                direction: self.0,
            })
        }
    }

    fn config() -> TriageConfig {
        let mut config = TriageConfig::default();
        config.routing.jurisdictions.push(JurisdictionConfig {
            name: "ward-12".into(),
            boundary: vec![
                GeoPoint::new(12.80, 77.50),
                GeoPoint::new(12.80, 77.70),
                GeoPoint::new(13.00, 77.70),
                GeoPoint::new(13.00, 77.50),
            ],
            default_department: "public-works".into(),
            departments: BTreeMap::new(),
        });
        config
    }

    fn engine(direction: ChangeDirection) -> TriageOrchestrator {
        let config = ConfigHandle::new(config()).unwrap();
        TriageOrchestrator::new(config, Arc::new(FirstWord), Arc::new(Fixed(direction)))
    }

    fn input(text: &str, lat: f64, lon: f64, submitter: &str) -> ReportInput {
        ReportInput {
            text: text.into(),
            image: None,
            location: Some(ReportedLocation::new(GeoPoint::new(lat, lon))),
            channel: Channel::Mobile,
            submitter_id: submitter.into(),
        }
    }

    fn proof(issue_id: &str, lat: f64, lon: f64) -> ResolutionProof {
        ResolutionProof {
            issue_id: issue_id.into(),
            after_image: ImageRef::new("after.jpg"),
            submitted_at: Utc::now() + chrono::Duration::seconds(5),
            location: GeoPoint::new(lat, lon),
            department_id: "public-works".into(),
        }
    }

    #[tokio::test]
    async fn test_create_routes_and_assigns() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();

        assert_eq!(out.disposition, Disposition::Created);
        assert_eq!(out.state, IssueState::Assigned);
        assert_eq!(out.department, "public-works");
        assert!(engine.index().contains(&out.issue_id));

        let issue = engine.registry().get(&out.issue_id).unwrap();
        assert!(issue.assigned_at.is_some());
        assert_eq!(issue.jurisdiction.as_deref(), Some("ward-12"));
        assert!(issue.has_visited(IssueState::Assigned));
    }

    #[tokio::test]
    async fn test_outside_jurisdictions_goes_to_unassigned_queue() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("garbage dumped", 28.6, 77.2, "a"))
            .await
            .unwrap();
        assert_eq!(out.state, IssueState::Open);
        assert_eq!(out.department, crate::model::UNASSIGNED_QUEUE);
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_is_merged() {
        let engine = engine(ChangeDirection::Improved);
        let first = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        let second = engine
            .submit_report(input("pothole main street again", 12.9003, 77.6003, "b"))
            .await
            .unwrap();

        assert_eq!(second.disposition, Disposition::Merged);
        assert_eq!(second.issue_id, first.issue_id);
        assert_eq!(second.contributors, 2);
        assert_eq!(engine.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_incompatible_category_is_not_merged() {
        let engine = engine(ChangeDirection::Improved);
        let a = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        let b = engine
            .submit_report(input("garbage on main street", 12.9, 77.6, "b"))
            .await
            .unwrap();
        assert_ne!(a.issue_id, b.issue_id);
    }

    #[tokio::test]
    async fn test_resubmission_is_refused() {
        let engine = engine(ChangeDirection::Improved);
        let report = Report::from_input(input("pothole on main street", 12.9, 77.6, "a"), Utc::now());
        engine.submit(report.clone()).await.unwrap();

        let err = engine.submit(report).await.unwrap_err();
        assert_eq!(err.code(), "REPORT_ALREADY_ACCEPTED");

        // Same content through the same channel is a retry too
        let err = engine
            .submit_report(input("Pothole on  main street", 12.9, 77.6, "a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REPORT_ALREADY_ACCEPTED");
    }

    #[tokio::test]
    async fn test_classification_failure_goes_to_manual_review() {
        let engine = engine(ChangeDirection::Improved);
        let mut events = engine.events().subscribe();

        let out = engine
            .submit_report(input("fail to classify this", 12.9, 77.6, "a"))
            .await
            .unwrap();
        assert_eq!(out.disposition, Disposition::ManualReview);
        assert_eq!(out.state, IssueState::ManualReview);
        assert!(!engine.index().contains(&out.issue_id));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "report_queued_for_review");

        let issue = engine
            .resolve_manual_review(&out.issue_id, "drainage", Actor::Operator("op".into()))
            .await
            .unwrap();
        assert_eq!(issue.state, IssueState::Assigned);
        assert_eq!(issue.category.as_str(), "drainage");
        assert!(engine.index().contains(&out.issue_id));
    }

    #[tokio::test]
    async fn test_manual_review_rejects_unknown_category() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("fail", 12.9, 77.6, "a"))
            .await
            .unwrap();
        let err = engine
            .resolve_manual_review(&out.issue_id, "volcano", Actor::Operator("op".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::UnknownCategory(_)));
    }

    #[tokio::test]
    async fn test_invalid_image_is_stripped_not_fatal() {
        let engine = engine(ChangeDirection::Improved);
        let mut report = input("pothole on main street", 12.9, 77.6, "a");
        report.image = Some(ImageRef::new("scan.pdf"));

        let out = engine.submit_report(report).await.unwrap();
        assert_eq!(out.disposition, Disposition::Created);
        assert!(out.warnings.iter().any(|w| w.contains("image ignored")));
        assert!(engine.registry().get(&out.issue_id).unwrap().before_image.is_none());
    }

    #[tokio::test]
    async fn test_empty_report_is_invalid() {
        let engine = engine(ChangeDirection::Improved);
        let err = engine.submit_report(input("   ", 12.9, 77.6, "a")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_proof_requires_assigned_or_in_progress() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("garbage dumped", 28.6, 77.2, "a"))
            .await
            .unwrap();
        let err = engine.submit_proof(proof(&out.issue_id, 28.6, 77.2)).await.unwrap_err();
        assert_eq!(err.code(), "WRONG_STATE");

        let err = engine.submit_proof(proof("missing", 0.0, 0.0)).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rejected_proof_reenters_in_progress() {
        let engine = engine(ChangeDirection::Unchanged);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();

        let outcome = engine.submit_proof(proof(&out.issue_id, 12.9, 77.6)).await.unwrap();
        assert_eq!(outcome.verdict.reject_reason(), Some(RejectReason::NoVisibleChange));
        assert_eq!(outcome.state, IssueState::InProgress);

        let issue = engine.registry().get(&out.issue_id).unwrap();
        assert!(issue.has_visited(IssueState::Disputed));
        assert!(issue.accepted_proof.is_none());
    }

    #[tokio::test]
    async fn test_accepted_proof_then_close_due() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();

        let outcome = engine.submit_proof(proof(&out.issue_id, 12.9, 77.6)).await.unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(outcome.state, IssueState::Resolved);
        assert!(!engine.index().contains(&out.issue_id));

        // Still inside the grace period
        assert!(engine.close_due(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::days(4);
        assert_eq!(engine.close_due(later).await.unwrap(), vec![out.issue_id.clone()]);
        let issue = engine.registry().get(&out.issue_id).unwrap();
        assert_eq!(issue.state, IssueState::Closed);
    }

    #[tokio::test]
    async fn test_dispute_cancels_scheduled_closure() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        engine.submit_proof(proof(&out.issue_id, 12.9, 77.6)).await.unwrap();

        let issue = engine
            .dispute_resolution(&out.issue_id, Actor::Citizen("a".into()), "still there")
            .await
            .unwrap();
        assert_eq!(issue.state, IssueState::InProgress);
        assert!(issue.closes_at.is_none());
        assert!(engine.index().contains(&out.issue_id));

        let later = Utc::now() + chrono::Duration::days(4);
        assert!(engine.close_due(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reassignment_makes_older_proofs_stale() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();

        let mut early = proof(&out.issue_id, 12.9, 77.6);
        early.submitted_at = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine
            .assign(&out.issue_id, "roads", Actor::Operator("op".into()))
            .await
            .unwrap();

        let outcome = engine.submit_proof(early).await.unwrap();
        assert_eq!(outcome.verdict.reject_reason(), Some(RejectReason::StaleProof));

        let issue = engine.registry().get(&out.issue_id).unwrap();
        assert_eq!(issue.department, "roads");
        assert!(issue
            .audit
            .iter()
            .any(|e| matches!(e.event, AuditEvent::Reassigned { .. })));
    }

    #[tokio::test]
    async fn test_cancel_removes_from_index() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        engine
            .cancel(&out.issue_id, Actor::Operator("op".into()), "duplicate of paper complaint")
            .await
            .unwrap();
        assert!(!engine.index().contains(&out.issue_id));

        let err = engine.start_work(&out.issue_id, Actor::System).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_TERMINAL");

        // A new nearby report now starts a fresh issue
        let again = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "b"))
            .await
            .unwrap();
        assert_eq!(again.disposition, Disposition::Created);
    }

    #[tokio::test]
    async fn test_override_can_lower_severity() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("sewage overflow", 12.9, 77.6, "a"))
            .await
            .unwrap();
        let before = engine.registry().get(&out.issue_id).unwrap();

        let issue = engine
            .override_severity(&out.issue_id, Severity::MIN, Actor::Operator("op".into()), "minor")
            .await
            .unwrap();
        assert!(issue.severity < before.severity);
        assert!(issue.sla_deadline > before.sla_deadline);
    }

    #[tokio::test]
    async fn test_feedback_allowed_on_terminal_issue() {
        let engine = engine(ChangeDirection::Improved);
        let out = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        engine
            .cancel(&out.issue_id, Actor::System, "test")
            .await
            .unwrap();

        let issue = engine
            .record_feedback(&out.issue_id, "c", FeedbackKind::Upvote)
            .await
            .unwrap();
        assert_eq!(issue.feedback.upvotes, 1);
        assert_eq!(engine.feedback_log().len(), 1);

        let err = engine
            .record_feedback(&out.issue_id, "c", FeedbackKind::Rating(9))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_FEEDBACK");
        assert_eq!(engine.feedback_log().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_index_skips_unmergeable_issues() {
        let engine = engine(ChangeDirection::Improved);
        let open = engine
            .submit_report(input("pothole on main street", 12.9, 77.6, "a"))
            .await
            .unwrap();
        engine
            .submit_report(input("fail", 12.95, 77.65, "b"))
            .await
            .unwrap();

        assert_eq!(engine.rebuild_index().unwrap(), 1);
        assert!(engine.index().contains(&open.issue_id));
    }
}
