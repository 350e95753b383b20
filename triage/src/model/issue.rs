//! The Issue aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::Centroid;
use super::image::ImageRef;
use super::proof::ResolutionProof;
use super::{Category, DepartmentId, IssueId, ReportId, Severity};
use crate::dedup::Signature;
use crate::registry::lifecycle::{Actor, IssueState};

/// Running totals of citizen feedback on an issue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackTally {
    pub upvotes: u32,
    pub ratings: u32,
    pub rating_sum: u32,
    pub comments: u32,
}

impl FeedbackTally {
    /// Mean satisfaction rating, if any ratings were given
    pub fn average_rating(&self) -> Option<f64> {
        (self.ratings > 0).then(|| self.rating_sum as f64 / self.ratings as f64)
    }
}

/// What happened to an issue, for the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Lifecycle state change
    Transition {
        from: IssueState,
        to: IssueState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// A duplicate report was folded into the issue
    ReportMerged {
        report_id: ReportId,
        severity_before: Severity,
        severity_after: Severity,
    },
    /// Severity set explicitly, the only way it may decrease
    SeverityOverride {
        from: Severity,
        to: Severity,
        reason: String,
    },
    /// Department changed
    Reassigned {
        from: DepartmentId,
        to: DepartmentId,
    },
}

/// A timestamped, attributed audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub event: AuditEvent,
}

/// The canonical civic problem record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    /// Creation order; older issues win similarity ties
    pub seq: u64,
    pub category: Category,
    /// Weighted centroid of contributing report locations
    pub location: Option<Centroid>,
    /// Jurisdiction (constituency) the issue was routed through
    pub jurisdiction: Option<String>,
    pub severity: Severity,
    /// Contributing reports in arrival order; never empty
    pub reports: Vec<ReportId>,
    /// Token signature accumulated from contributing report texts
    pub signature: Signature,
    /// Text of the first report
    pub summary: String,
    pub department: DepartmentId,
    pub state: IssueState,
    pub sla_deadline: DateTime<Utc>,
    pub feedback: FeedbackTally,
    /// First valid report image, compared against resolution proofs
    pub before_image: Option<ImageRef>,
    /// Last time a department was assigned
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_proof: Option<ResolutionProof>,
    /// When a resolved issue is due to close
    pub closes_at: Option<DateTime<Utc>>,
    pub audit: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn contributor_count(&self) -> usize {
        self.reports.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the issue has passed its SLA deadline without being resolved
    pub fn is_sla_breached(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.state,
            IssueState::Resolved | IssueState::Closed | IssueState::Cancelled
        ) && now > self.sla_deadline
    }

    /// Lifecycle transitions in the order they were applied
    pub fn transitions(&self) -> impl Iterator<Item = (IssueState, IssueState)> + '_ {
        self.audit.iter().filter_map(|entry| match &entry.event {
            AuditEvent::Transition { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
    }

    /// Whether the issue ever entered the given state
    pub fn has_visited(&self, state: IssueState) -> bool {
        self.transitions().any(|(_, to)| to == state)
    }
}
