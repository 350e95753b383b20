//! Outbound triage events
//!
//! Each event carries the issue id plus the fields a notification
//! collaborator needs to render it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Category, DepartmentId, IssueId, ReportId, Severity};
use crate::registry::Actor;
use crate::verifier::RejectReason;

/// Everything the engine announces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriageEvent {
    /// First non-duplicate report created a new issue
    IssueCreated {
        issue_id: IssueId,
        report_id: ReportId,
        category: Category,
        severity: Severity,
        department: DepartmentId,
        timestamp: DateTime<Utc>,
    },

    /// A duplicate report was folded into an existing issue
    IssueMerged {
        issue_id: IssueId,
        report_id: ReportId,
        contributors: usize,
        severity_before: Severity,
        severity_after: Severity,
        timestamp: DateTime<Utc>,
    },

    /// A department took ownership
    IssueAssigned {
        issue_id: IssueId,
        department: DepartmentId,
        timestamp: DateTime<Utc>,
    },

    /// A resolution proof was accepted
    IssueResolved {
        issue_id: IssueId,
        department: DepartmentId,
        closes_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A proof was rejected or a resolution contested
    IssueDisputed {
        issue_id: IssueId,
        reason: Option<RejectReason>,
        detail: String,
        actor: Actor,
        timestamp: DateTime<Utc>,
    },

    /// Closure grace period elapsed
    IssueClosed {
        issue_id: IssueId,
        timestamp: DateTime<Utc>,
    },

    /// Administratively archived
    IssueCancelled {
        issue_id: IssueId,
        actor: Actor,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Classification failed; an operator must label the report
    ReportQueuedForReview {
        issue_id: IssueId,
        report_id: ReportId,
        cause: String,
        timestamp: DateTime<Utc>,
    },
}

impl TriageEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::IssueCreated { timestamp, .. }
            | Self::IssueMerged { timestamp, .. }
            | Self::IssueAssigned { timestamp, .. }
            | Self::IssueResolved { timestamp, .. }
            | Self::IssueDisputed { timestamp, .. }
            | Self::IssueClosed { timestamp, .. }
            | Self::IssueCancelled { timestamp, .. }
            | Self::ReportQueuedForReview { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IssueCreated { .. } => "issue_created",
            Self::IssueMerged { .. } => "issue_merged",
            Self::IssueAssigned { .. } => "issue_assigned",
            Self::IssueResolved { .. } => "issue_resolved",
            Self::IssueDisputed { .. } => "issue_disputed",
            Self::IssueClosed { .. } => "issue_closed",
            Self::IssueCancelled { .. } => "issue_cancelled",
            Self::ReportQueuedForReview { .. } => "report_queued_for_review",
        }
    }

    pub fn issue_id(&self) -> &str {
        match self {
            Self::IssueCreated { issue_id, .. }
            | Self::IssueMerged { issue_id, .. }
            | Self::IssueAssigned { issue_id, .. }
            | Self::IssueResolved { issue_id, .. }
            | Self::IssueDisputed { issue_id, .. }
            | Self::IssueClosed { issue_id, .. }
            | Self::IssueCancelled { issue_id, .. }
            | Self::ReportQueuedForReview { issue_id, .. } => issue_id,
        }
    }
}
