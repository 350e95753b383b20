//! Issue lifecycle state machine
//!
//! ```text
//!  ManualReview ──▶ Open ──▶ Assigned ──▶ InProgress ──▶ Resolved ──▶ Closed
//!                              │  ▲          │  ▲           │
//!                              │  └──────────┘  │           │
//!                              └──▶ Disputed ───┘ ◀─────────┘
//!
//!  any non-terminal ──▶ Cancelled
//! ```
//!
//! `Closed` and `Cancelled` are terminal. `Disputed` is a pass-through: a
//! rejected or contested proof enters it and immediately re-enters
//! `InProgress`, leaving the dispute in the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RegistryError, RegistryResult};
use crate::model::{AuditEntry, AuditEvent, DepartmentId, Issue};

/// Lifecycle state of an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    /// Classification failed or was too uncertain; waiting for an operator
    ManualReview,
    /// Accepted but not yet owned by a department
    Open,
    /// Owned by a department
    Assigned,
    /// Department is working on it
    InProgress,
    /// Proof accepted; closure scheduled
    Resolved,
    /// Proof rejected or resolution contested
    Disputed,
    /// Archived after an accepted resolution
    Closed,
    /// Archived administratively
    Cancelled,
}

impl IssueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    /// States in which a resolution proof may be submitted
    pub fn accepts_proof(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// States in which duplicate reports may be merged
    pub fn accepts_merge(self) -> bool {
        matches!(self, Self::Open | Self::Assigned | Self::InProgress)
    }

    /// Whether `self -> to` is an edge of the state machine
    pub fn can_transition_to(self, to: IssueState) -> bool {
        use IssueState::*;
        match (self, to) {
            (Closed | Cancelled, _) => false,
            (_, Cancelled) => true,
            (ManualReview, Open) => true,
            (Open, Assigned) => true,
            // Reassignment resets the assignment clock
            (Assigned | InProgress, Assigned) => true,
            (Assigned, InProgress) => true,
            (Assigned | InProgress, Resolved) => true,
            (Assigned | InProgress | Resolved, Disputed) => true,
            (Disputed, InProgress) => true,
            (Resolved, Closed) => true,
            _ => false,
        }
    }

    pub fn all() -> &'static [IssueState] {
        &[
            Self::ManualReview,
            Self::Open,
            Self::Assigned,
            Self::InProgress,
            Self::Resolved,
            Self::Disputed,
            Self::Closed,
            Self::Cancelled,
        ]
    }
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ManualReview => write!(f, "manual_review"),
            Self::Open => write!(f, "open"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Disputed => write!(f, "disputed"),
            Self::Closed => write!(f, "closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Who caused a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// The engine itself
    System,
    Department(DepartmentId),
    Operator(String),
    Citizen(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Department(id) => write!(f, "department:{}", id),
            Self::Operator(id) => write!(f, "operator:{}", id),
            Self::Citizen(id) => write!(f, "citizen:{}", id),
        }
    }
}

/// Apply a state transition to an issue, recording it in the audit trail.
///
/// Enforces the state machine, refuses to touch terminal issues, and refuses
/// closure without an accepted resolution proof.
pub fn apply_transition(
    issue: &mut Issue,
    to: IssueState,
    actor: Actor,
    note: Option<String>,
    at: DateTime<Utc>,
) -> RegistryResult<()> {
    let from = issue.state;
    if from.is_terminal() {
        return Err(RegistryError::AlreadyTerminal {
            issue_id: issue.id.clone(),
            state: from,
        });
    }
    if !from.can_transition_to(to) {
        return Err(RegistryError::InvalidTransition {
            issue_id: issue.id.clone(),
            from,
            to,
        });
    }
    if to == IssueState::Closed && issue.accepted_proof.is_none() {
        return Err(RegistryError::ClosureWithoutProof(issue.id.clone()));
    }

    issue.state = to;
    issue.audit.push(AuditEntry {
        at,
        actor,
        event: AuditEvent::Transition { from, to, note },
    });
    Ok(())
}
