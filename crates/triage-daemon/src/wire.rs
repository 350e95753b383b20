//! JSONL wire protocol
//!
//! One JSON object per line on stdin, one response per line on stdout.
//! Requests carry an `op` tag and an optional caller-chosen `id` that is
//! echoed back:
//!
//! ```text
//! {"id":1,"op":"submit_report","report":{"text":"pothole on main st","channel":"sms","submitter_id":"c1"}}
//! {"id":1,"ok":true,"result":{"issue_id":"…","disposition":"created",…}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use triage::{
    Actor, Category, FeedbackKind, IssueState, ReportInput, ResolutionProof, Severity, TriageError,
};

/// A request line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SubmitReport {
        report: ReportInput,
    },
    SubmitProof {
        proof: ResolutionProof,
    },
    ResolveManualReview {
        issue_id: String,
        category: Category,
        actor: Actor,
    },
    Assign {
        issue_id: String,
        department: String,
        actor: Actor,
    },
    StartWork {
        issue_id: String,
        actor: Actor,
    },
    Cancel {
        issue_id: String,
        actor: Actor,
        reason: String,
    },
    OverrideSeverity {
        issue_id: String,
        severity: Severity,
        actor: Actor,
        reason: String,
    },
    DisputeResolution {
        issue_id: String,
        actor: Actor,
        reason: String,
    },
    Feedback {
        issue_id: String,
        submitter_id: String,
        feedback: FeedbackKind,
    },
    GetIssue {
        issue_id: String,
    },
    /// Contributing reports of an issue, oldest first
    IssueReports {
        issue_id: String,
    },
    Dashboard {
        view: DashboardView,
    },
    /// Retained notifications for one issue, or counts by type
    Events {
        #[serde(default)]
        issue_id: Option<String>,
    },
    CloseDue,
    Recalibrate,
    ReloadConfig,
    SaveSnapshot,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Self::SubmitReport { .. } => "submit_report",
            Self::SubmitProof { .. } => "submit_proof",
            Self::ResolveManualReview { .. } => "resolve_manual_review",
            Self::Assign { .. } => "assign",
            Self::StartWork { .. } => "start_work",
            Self::Cancel { .. } => "cancel",
            Self::OverrideSeverity { .. } => "override_severity",
            Self::DisputeResolution { .. } => "dispute_resolution",
            Self::Feedback { .. } => "feedback",
            Self::GetIssue { .. } => "get_issue",
            Self::IssueReports { .. } => "issue_reports",
            Self::Dashboard { .. } => "dashboard",
            Self::Events { .. } => "events",
            Self::CloseDue => "close_due",
            Self::Recalibrate => "recalibrate",
            Self::ReloadConfig => "reload_config",
            Self::SaveSnapshot => "save_snapshot",
        }
    }
}

/// Read-only dashboard views
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DashboardView {
    Overview,
    ByDepartment { department: String },
    SlaBreaches,
    ByCategory { category: Category },
    ByState { state: IssueState },
    Hotspots {
        #[serde(default = "default_hotspot_cell")]
        cell_size_m: f64,
        #[serde(default = "default_hotspot_min")]
        min_issues: usize,
    },
    CategoryPerformance,
    JurisdictionPerformance,
    TimeSeries {
        #[serde(default = "default_days")]
        days: u32,
    },
    Urgent {
        #[serde(default = "default_limit")]
        limit: usize,
    },
}

fn default_hotspot_cell() -> f64 {
    500.0
}

fn default_hotspot_min() -> usize {
    3
}

fn default_days() -> u32 {
    30
}

fn default_limit() -> usize {
    20
}

/// A response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl Response {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
                retryable,
            }),
        }
    }

    pub fn from_error(id: Option<Value>, err: &TriageError) -> Self {
        Self::error(id, err.code(), err.to_string(), err.is_retryable())
    }

    /// Malformed request line
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(None, "BAD_REQUEST", message, false)
    }
}
