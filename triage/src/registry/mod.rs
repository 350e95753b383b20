//! Issue Registry — the authoritative store of issues
//!
//! # Architecture
//!
//! Each issue lives in its own slot:
//!
//! - a published `Arc<Issue>` behind a short-lived `RwLock`, which readers
//!   clone without waiting on writers;
//! - an async mutex gate that serialises every mutation of that issue.
//!
//! A mutation takes the gate through [`IssueRegistry::lock`], works on a
//! private copy of the issue, and publishes the copy only when every step
//! succeeded. A failed merge or transition therefore leaves no trace.
//! Mutations of distinct issues never contend.
//!
//! Report ownership (report id and content fingerprint → issue) is tracked
//! registry-wide so a report can be claimed by exactly one issue. The
//! registry also keeps every accepted [`Report`] by id. A fingerprint only
//! marks a retry while its issue is live: it is released when the issue
//! closes or is cancelled, so the same complaint can be reported again.
//!
//! # Usage
//!
//! ```ignore
//! let registry = IssueRegistry::new().shared();
//! let issue = registry.insert(issue, &report)?;
//!
//! let mut guard = registry.lock(&issue.id).await?;
//! guard.transition(IssueState::Assigned, Actor::System, None, Utc::now())?;
//! ```

pub mod lifecycle;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

pub use lifecycle::{apply_transition, Actor, IssueState};
pub use snapshot::{load_snapshot, save_snapshot, RegistrySnapshot, SnapshotError};

use crate::config::TriageConfig;
use crate::dedup::Signature;
use crate::model::{
    AuditEntry, AuditEvent, Centroid, Issue, IssueId, Report, ReportId, Severity,
};

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Issue not found: {0}")]
    NotFound(IssueId),

    #[error("Issue {issue_id} is already terminal ({state})")]
    AlreadyTerminal { issue_id: IssueId, state: IssueState },

    #[error("Issue {issue_id} is {state}; expected {expected}")]
    WrongState {
        issue_id: IssueId,
        state: IssueState,
        expected: String,
    },

    #[error("Invalid transition for issue {issue_id}: {from} -> {to}")]
    InvalidTransition {
        issue_id: IssueId,
        from: IssueState,
        to: IssueState,
    },

    #[error("Issue {0} cannot close without an accepted resolution proof")]
    ClosureWithoutProof(IssueId),

    #[error("Report {report_id} already belongs to issue {issue_id}")]
    ReportAlreadyAssigned {
        report_id: ReportId,
        issue_id: IssueId,
    },

    #[error("Issue already exists: {0}")]
    DuplicateIssue(IssueId),

    #[error("Issue {0} has no contributing reports")]
    NoContributors(IssueId),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Shared reference to IssueRegistry
pub type SharedIssueRegistry = Arc<IssueRegistry>;

struct IssueSlot {
    current: RwLock<Arc<Issue>>,
    gate: Arc<Mutex<()>>,
}

impl IssueSlot {
    fn new(issue: Issue) -> Self {
        Self {
            current: RwLock::new(Arc::new(issue)),
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn load(&self) -> RegistryResult<Arc<Issue>> {
        self.current
            .read()
            .map(|issue| issue.clone())
            .map_err(|_| RegistryError::LockPoisoned)
    }

    fn publish(&self, issue: Issue) -> RegistryResult<Arc<Issue>> {
        let issue = Arc::new(issue);
        let mut current = self
            .current
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?;
        *current = issue.clone();
        Ok(issue)
    }
}

#[derive(Default)]
struct Ownership {
    reports: HashMap<ReportId, IssueId>,
    fingerprints: HashMap<String, IssueId>,
    accepted: HashMap<ReportId, Arc<Report>>,
}

impl Ownership {
    fn check_unclaimed(&self, report_id: &str, fingerprint: &str) -> RegistryResult<()> {
        let existing = self
            .reports
            .get(report_id)
            .or_else(|| self.fingerprints.get(fingerprint));
        match existing {
            Some(issue_id) => Err(RegistryError::ReportAlreadyAssigned {
                report_id: report_id.to_string(),
                issue_id: issue_id.clone(),
            }),
            None => Ok(()),
        }
    }

    fn claim(&mut self, report: &Report, fingerprint: String, issue_id: &str) {
        self.reports.insert(report.id.clone(), issue_id.to_string());
        self.fingerprints.insert(fingerprint, issue_id.to_string());
        self.accepted.insert(report.id.clone(), Arc::new(report.clone()));
    }

    /// Drop the fingerprints still pointing at `issue`; report ids stay claimed
    fn release_fingerprints(&mut self, issue: &Issue) -> usize {
        let fingerprints: Vec<String> = issue
            .reports
            .iter()
            .filter_map(|id| self.accepted.get(id))
            .map(|report| report.fingerprint())
            .collect();
        let mut released = 0;
        for fingerprint in fingerprints {
            if self.fingerprints.get(&fingerprint) == Some(&issue.id) {
                self.fingerprints.remove(&fingerprint);
                released += 1;
            }
        }
        released
    }
}

/// Result of folding a duplicate report into an issue
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub issue: Arc<Issue>,
    pub severity_before: Severity,
    pub severity_raised: bool,
}

/// Authoritative in-memory issue store
pub struct IssueRegistry {
    slots: RwLock<HashMap<IssueId, Arc<IssueSlot>>>,
    owners: RwLock<Ownership>,
    next_seq: AtomicU64,
}

impl IssueRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            owners: RwLock::new(Ownership::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedIssueRegistry {
        Arc::new(self)
    }

    /// Allocate the next creation sequence number
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Insert a freshly created issue together with the report that created
    /// it. The report (by id and by fingerprint) is claimed atomically with
    /// the insert.
    pub fn insert(&self, issue: Issue, report: &Report) -> RegistryResult<Arc<Issue>> {
        if issue.reports.is_empty() {
            return Err(RegistryError::NoContributors(issue.id.clone()));
        }

        let fingerprint = report.fingerprint();
        let mut owners = self.owners.write().map_err(|_| RegistryError::LockPoisoned)?;
        owners.check_unclaimed(&report.id, &fingerprint)?;

        let mut slots = self.slots.write().map_err(|_| RegistryError::LockPoisoned)?;
        if slots.contains_key(&issue.id) {
            return Err(RegistryError::DuplicateIssue(issue.id.clone()));
        }

        owners.claim(report, fingerprint, &issue.id);

        let id = issue.id.clone();
        let slot = Arc::new(IssueSlot::new(issue));
        let published = slot.load()?;
        slots.insert(id.clone(), slot);

        debug!(issue_id = %id, report_id = %report.id, "Issue inserted");
        Ok(published)
    }

    fn slot(&self, issue_id: &str) -> RegistryResult<Arc<IssueSlot>> {
        self.slots
            .read()
            .map_err(|_| RegistryError::LockPoisoned)?
            .get(issue_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(issue_id.to_string()))
    }

    /// Current published state of an issue
    pub fn get(&self, issue_id: &str) -> RegistryResult<Arc<Issue>> {
        self.slot(issue_id)?.load()
    }

    /// Issue owning a report, if the report was accepted
    pub fn owner_of(&self, report_id: &str) -> Option<IssueId> {
        self.owners
            .read()
            .ok()
            .and_then(|o| o.reports.get(report_id).cloned())
    }

    /// Live issue owning a report with the given content fingerprint
    pub fn owner_of_fingerprint(&self, fingerprint: &str) -> Option<IssueId> {
        self.owners
            .read()
            .ok()
            .and_then(|o| o.fingerprints.get(fingerprint).cloned())
    }

    /// An accepted report
    pub fn report(&self, report_id: &str) -> Option<Arc<Report>> {
        self.owners
            .read()
            .ok()
            .and_then(|o| o.accepted.get(report_id).cloned())
    }

    /// Contributing reports of an issue, in the order they were accepted
    pub fn reports_of(&self, issue_id: &str) -> RegistryResult<Vec<Arc<Report>>> {
        let issue = self.get(issue_id)?;
        let owners = self.owners.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(issue
            .reports
            .iter()
            .filter_map(|id| owners.accepted.get(id).cloned())
            .collect())
    }

    /// Consistent per-issue snapshots of every issue, oldest first
    pub fn all(&self) -> RegistryResult<Vec<Arc<Issue>>> {
        let slots: Vec<Arc<IssueSlot>> = self
            .slots
            .read()
            .map_err(|_| RegistryError::LockPoisoned)?
            .values()
            .cloned()
            .collect();
        let mut issues = slots
            .iter()
            .map(|slot| slot.load())
            .collect::<RegistryResult<Vec<_>>>()?;
        issues.sort_by_key(|issue| issue.seq);
        Ok(issues)
    }

    pub fn len(&self) -> usize {
        self.slots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire exclusive mutation rights over one issue
    pub async fn lock(&self, issue_id: &str) -> RegistryResult<IssueGuard<'_>> {
        let slot = self.slot(issue_id)?;
        let gate = slot.gate.clone().lock_owned().await;
        Ok(IssueGuard {
            registry: self,
            slot,
            _gate: gate,
        })
    }

    /// Lock an issue and apply one transition
    pub async fn transition(
        &self,
        issue_id: &str,
        to: IssueState,
        actor: Actor,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> RegistryResult<Arc<Issue>> {
        let mut guard = self.lock(issue_id).await?;
        guard.transition(to, actor, note, at)
    }

    fn release_fingerprints(&self, issue: &Issue) -> RegistryResult<()> {
        let released = self
            .owners
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?
            .release_fingerprints(issue);
        debug!(issue_id = %issue.id, state = %issue.state, released, "Released report fingerprints");
        Ok(())
    }
}

impl Default for IssueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive mutation rights over one issue.
///
/// Every mutating method works on a copy and publishes it only on success.
pub struct IssueGuard<'a> {
    registry: &'a IssueRegistry,
    slot: Arc<IssueSlot>,
    _gate: OwnedMutexGuard<()>,
}

impl IssueGuard<'_> {
    /// Published state of the locked issue
    pub fn issue(&self) -> RegistryResult<Arc<Issue>> {
        self.slot.load()
    }

    /// Apply an arbitrary all-or-nothing update
    pub fn update<F>(&mut self, at: DateTime<Utc>, f: F) -> RegistryResult<Arc<Issue>>
    where
        F: FnOnce(&mut Issue) -> RegistryResult<()>,
    {
        let current = self.slot.load()?;
        let mut draft = (*current).clone();
        f(&mut draft)?;
        if draft.reports.is_empty() {
            return Err(RegistryError::NoContributors(draft.id));
        }
        draft.updated_at = at;
        let published = self.slot.publish(draft)?;
        if published.is_terminal() && !current.is_terminal() {
            self.registry.release_fingerprints(&published)?;
        }
        Ok(published)
    }

    /// Apply one lifecycle transition
    pub fn transition(
        &mut self,
        to: IssueState,
        actor: Actor,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> RegistryResult<Arc<Issue>> {
        self.update(at, |issue| apply_transition(issue, to, actor, note, at))
    }

    /// Fold a duplicate report into the issue.
    ///
    /// Appends the report, raises severity to `max(existing, incoming)`,
    /// refines the centroid, widens the token signature, adopts the report
    /// image as before-image if the issue had none, and recomputes the SLA
    /// deadline when severity rose. The report claim and the new issue
    /// state become visible together or not at all.
    pub fn merge_report(
        &mut self,
        report: &Report,
        incoming: Severity,
        signature: &Signature,
        config: &TriageConfig,
        at: DateTime<Utc>,
    ) -> RegistryResult<MergeOutcome> {
        let current = self.slot.load()?;
        if current.state.is_terminal() {
            return Err(RegistryError::AlreadyTerminal {
                issue_id: current.id.clone(),
                state: current.state,
            });
        }
        if !current.state.accepts_merge() {
            return Err(RegistryError::WrongState {
                issue_id: current.id.clone(),
                state: current.state,
                expected: "open, assigned or in_progress".into(),
            });
        }

        let mut draft = (*current).clone();
        let severity_before = draft.severity;
        let severity_after = severity_before.max(incoming);

        draft.reports.push(report.id.clone());
        draft.severity = severity_after;
        if let Some(loc) = &report.location {
            draft.location = Some(match &draft.location {
                Some(centroid) => centroid.absorb(loc),
                None => Centroid::from_location(loc),
            });
        }
        draft.signature = draft.signature.union(signature);
        if draft.before_image.is_none() {
            draft.before_image = report.image.clone();
        }
        if severity_after > severity_before {
            draft.sla_deadline = draft.created_at + config.sla_for(&draft.category, severity_after);
        }
        draft.audit.push(AuditEntry {
            at,
            actor: Actor::System,
            event: AuditEvent::ReportMerged {
                report_id: report.id.clone(),
                severity_before,
                severity_after,
            },
        });
        draft.updated_at = at;

        // Claim and publish under the ownership lock so neither is visible
        // without the other
        let fingerprint = report.fingerprint();
        let mut owners = self
            .registry
            .owners
            .write()
            .map_err(|_| RegistryError::LockPoisoned)?;
        owners.check_unclaimed(&report.id, &fingerprint)?;
        let issue = self.slot.publish(draft)?;
        owners.claim(report, fingerprint, &issue.id);
        drop(owners);

        Ok(MergeOutcome {
            issue,
            severity_before,
            severity_raised: severity_after > severity_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Channel, FeedbackTally, GeoPoint, ReportInput, ReportedLocation};

    fn report(text: &str, lat: f64, lon: f64) -> Report {
        Report::from_input(
            ReportInput {
                text: text.to_string(),
                image: None,
                location: Some(ReportedLocation::new(GeoPoint::new(lat, lon))),
                channel: Channel::Web,
                submitter_id: "citizen".to_string(),
            },
            Utc::now(),
        )
    }

    fn issue_for(registry: &IssueRegistry, report: &Report, severity: u8) -> Issue {
        let now = Utc::now();
        Issue {
            id: uuid::Uuid::new_v4().to_string(),
            seq: registry.next_seq(),
            category: Category::new("pothole"),
            location: report.location.as_ref().map(Centroid::from_location),
            jurisdiction: None,
            severity: Severity::new(severity).unwrap(),
            reports: vec![report.id.clone()],
            signature: Signature::from_text(&report.text),
            summary: report.text.clone(),
            department: "roads".to_string(),
            state: IssueState::Open,
            sla_deadline: now + chrono::Duration::hours(120),
            feedback: FeedbackTally::default(),
            before_image: None,
            assigned_at: None,
            accepted_proof: None,
            closes_at: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let registry = IssueRegistry::new();
        let r = report("pothole", 12.9, 77.6);
        let issue = issue_for(&registry, &r, 2);
        let id = issue.id.clone();
        registry.insert(issue, &r).unwrap();

        assert_eq!(registry.get(&id).unwrap().reports, vec![r.id.clone()]);
        assert_eq!(registry.owner_of(&r.id), Some(id.clone()));
        assert_eq!(registry.owner_of_fingerprint(&r.fingerprint()), Some(id));
    }

    #[test]
    fn test_insert_rejects_claimed_report() {
        let registry = IssueRegistry::new();
        let r = report("pothole", 12.9, 77.6);
        let first = issue_for(&registry, &r, 2);
        registry.insert(first, &r).unwrap();

        let second = issue_for(&registry, &r, 2);
        let err = registry.insert(second, &r).unwrap_err();
        assert!(matches!(err, RegistryError::ReportAlreadyAssigned { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let registry = IssueRegistry::new();
        assert!(matches!(registry.get("nope"), Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_merge_raises_severity_and_moves_centroid() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole on main st", 12.90, 77.60);
        let issue = issue_for(&registry, &r1, 2);
        let id = issue.id.clone();
        let deadline_before = issue.sla_deadline;
        registry.insert(issue, &r1).unwrap();

        let r2 = report("large pothole same street", 12.901, 77.601);
        let mut guard = registry.lock(&id).await.unwrap();
        let outcome = guard
            .merge_report(
                &r2,
                Severity::new(3).unwrap(),
                &Signature::from_text(&r2.text),
                &config,
                Utc::now(),
            )
            .unwrap();
        drop(guard);

        assert!(outcome.severity_raised);
        let issue = registry.get(&id).unwrap();
        assert_eq!(issue.severity.get(), 3);
        assert_eq!(issue.contributor_count(), 2);
        assert!((issue.location.unwrap().point.lat - 12.9005).abs() < 1e-9);
        assert!(issue.signature.contains("large"));
        assert_ne!(issue.sla_deadline, deadline_before);
        assert_eq!(registry.owner_of(&r2.id), Some(id));
    }

    #[tokio::test]
    async fn test_merge_never_lowers_severity() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole", 12.90, 77.60);
        let issue = issue_for(&registry, &r1, 4);
        let id = issue.id.clone();
        registry.insert(issue, &r1).unwrap();

        let r2 = report("small pothole", 12.90, 77.60);
        let mut guard = registry.lock(&id).await.unwrap();
        let outcome = guard
            .merge_report(&r2, Severity::MIN, &Signature::from_text(&r2.text), &config, Utc::now())
            .unwrap();
        assert!(!outcome.severity_raised);
        assert_eq!(outcome.issue.severity.get(), 4);
    }

    #[tokio::test]
    async fn test_failed_merge_leaves_no_trace() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole", 12.90, 77.60);
        let a = issue_for(&registry, &r1, 2);
        let a_id = a.id.clone();
        registry.insert(a, &r1).unwrap();

        let r2 = report("another pothole", 12.95, 77.65);
        let b = issue_for(&registry, &r2, 2);
        let b_id = b.id.clone();
        registry.insert(b, &r2).unwrap();

        // r2 already belongs to b; merging it into a must fail atomically
        let before = registry.get(&a_id).unwrap();
        let mut guard = registry.lock(&a_id).await.unwrap();
        let err = guard
            .merge_report(&r2, Severity::MAX, &Signature::from_text(&r2.text), &config, Utc::now())
            .unwrap_err();
        drop(guard);

        assert!(matches!(err, RegistryError::ReportAlreadyAssigned { .. }));
        assert_eq!(*registry.get(&a_id).unwrap(), *before);
        assert_eq!(registry.owner_of(&r2.id), Some(b_id));
    }

    #[tokio::test]
    async fn test_merge_on_poisoned_issue_claims_nothing() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole", 12.90, 77.60);
        let issue = issue_for(&registry, &r1, 2);
        let id = issue.id.clone();
        registry.insert(issue, &r1).unwrap();

        let slot = registry.slot(&id).unwrap();
        let _ = std::thread::spawn(move || {
            let _held = slot.current.write().unwrap();
            panic!("poison the issue slot");
        })
        .join();

        let r2 = report("pothole again", 12.90, 77.60);
        let mut guard = registry.lock(&id).await.unwrap();
        let err = guard
            .merge_report(&r2, Severity::MIN, &Signature::default(), &config, Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::LockPoisoned));
        assert_eq!(registry.owner_of(&r2.id), None);
        assert_eq!(registry.owner_of_fingerprint(&r2.fingerprint()), None);
        assert!(registry.report(&r2.id).is_none());
    }

    #[tokio::test]
    async fn test_merged_reports_are_kept() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole on main st", 12.90, 77.60);
        let issue = issue_for(&registry, &r1, 2);
        let id = issue.id.clone();
        registry.insert(issue, &r1).unwrap();

        let r2 = report("large pothole same street", 12.901, 77.601);
        let mut guard = registry.lock(&id).await.unwrap();
        guard
            .merge_report(&r2, Severity::MIN, &Signature::from_text(&r2.text), &config, Utc::now())
            .unwrap();
        drop(guard);

        let kept = registry.reports_of(&id).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(*kept[0], r1);
        assert_eq!(*kept[1], r2);
        assert_eq!(registry.report(&r2.id).unwrap().text, "large pothole same street");
    }

    #[tokio::test]
    async fn test_terminal_issue_releases_fingerprints() {
        for terminal in [IssueState::Cancelled, IssueState::Closed] {
            let registry = IssueRegistry::new();
            let r1 = report("pothole", 12.90, 77.60);
            let mut issue = issue_for(&registry, &r1, 2);
            if terminal == IssueState::Closed {
                issue.state = IssueState::Resolved;
                issue.accepted_proof = Some(crate::model::ResolutionProof {
                    issue_id: issue.id.clone(),
                    department_id: "roads".into(),
                    after_image: crate::model::ImageRef::new("https://img.example/after.jpg"),
                    location: GeoPoint::new(12.90, 77.60),
                    submitted_at: Utc::now(),
                });
            }
            let id = issue.id.clone();
            registry.insert(issue, &r1).unwrap();

            registry
                .transition(&id, terminal, Actor::System, None, Utc::now())
                .await
                .unwrap();
            assert_eq!(registry.owner_of_fingerprint(&r1.fingerprint()), None);
            assert_eq!(registry.owner_of(&r1.id), Some(id.clone()));

            // Same content, new submission
            let again = report("pothole", 12.90, 77.60);
            assert_eq!(again.fingerprint(), r1.fingerprint());
            let fresh = issue_for(&registry, &again, 2);
            let fresh_id = fresh.id.clone();
            registry.insert(fresh, &again).unwrap();
            assert_eq!(registry.owner_of_fingerprint(&again.fingerprint()), Some(fresh_id));
        }
    }

    #[tokio::test]
    async fn test_merge_refused_for_resolved_issue() {
        let registry = IssueRegistry::new();
        let config = TriageConfig::default();
        let r1 = report("pothole", 12.90, 77.60);
        let mut issue = issue_for(&registry, &r1, 2);
        issue.state = IssueState::Resolved;
        let id = issue.id.clone();
        registry.insert(issue, &r1).unwrap();

        let r2 = report("pothole again", 12.90, 77.60);
        let mut guard = registry.lock(&id).await.unwrap();
        let err = guard
            .merge_report(&r2, Severity::MIN, &Signature::default(), &config, Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::WrongState { .. }));
        assert_eq!(registry.owner_of(&r2.id), None);
    }

    #[tokio::test]
    async fn test_transition_records_audit_and_blocks_terminal() {
        let registry = IssueRegistry::new();
        let r = report("pothole", 12.90, 77.60);
        let issue = issue_for(&registry, &r, 2);
        let id = issue.id.clone();
        registry.insert(issue, &r).unwrap();

        registry
            .transition(&id, IssueState::Cancelled, Actor::Operator("op".into()), None, Utc::now())
            .await
            .unwrap();
        let err = registry
            .transition(&id, IssueState::Open, Actor::System, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyTerminal { .. }));

        let issue = registry.get(&id).unwrap();
        assert_eq!(issue.audit.len(), 1);
        assert_eq!(issue.audit[0].actor, Actor::Operator("op".into()));
    }

    #[tokio::test]
    async fn test_close_requires_proof() {
        let registry = IssueRegistry::new();
        let r = report("pothole", 12.90, 77.60);
        let mut issue = issue_for(&registry, &r, 2);
        issue.state = IssueState::Resolved;
        let id = issue.id.clone();
        registry.insert(issue, &r).unwrap();

        let err = registry
            .transition(&id, IssueState::Closed, Actor::System, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ClosureWithoutProof(_)));
        assert_eq!(registry.get(&id).unwrap().state, IssueState::Resolved);
    }

    #[tokio::test]
    async fn test_readers_not_blocked_by_held_gate() {
        let registry = IssueRegistry::new();
        let r = report("pothole", 12.90, 77.60);
        let issue = issue_for(&registry, &r, 2);
        let id = issue.id.clone();
        registry.insert(issue, &r).unwrap();

        let _guard = registry.lock(&id).await.unwrap();
        // get() does not wait on the mutation gate
        assert_eq!(registry.get(&id).unwrap().state, IssueState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_merges_are_serialized() {
        let registry = Arc::new(IssueRegistry::new());
        let config = Arc::new(TriageConfig::default());
        let r = report("pothole", 12.90, 77.60);
        let issue = issue_for(&registry, &r, 1);
        let id = issue.id.clone();
        registry.insert(issue, &r).unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let config = config.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let r = report(&format!("pothole report {}", i), 12.90, 77.60);
                let mut guard = registry.lock(&id).await.unwrap();
                guard
                    .merge_report(&r, Severity::MIN, &Signature::default(), &config, Utc::now())
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let issue = registry.get(&id).unwrap();
        assert_eq!(issue.contributor_count(), 33);
        let mut unique = issue.reports.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 33);
    }
}
