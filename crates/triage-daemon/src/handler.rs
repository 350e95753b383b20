//! Request dispatch onto the triage engine

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use triage::{
    save_snapshot, Dashboard, Issue, Report, TriageError, TriageOrchestrator, TriageResult,
};

use crate::config::DaemonConfig;
use crate::wire::{DashboardView, Envelope, Request, Response};

pub struct Handler {
    engine: Arc<TriageOrchestrator>,
    settings: Arc<DaemonConfig>,
}

impl Handler {
    pub fn new(engine: Arc<TriageOrchestrator>, settings: Arc<DaemonConfig>) -> Self {
        Self { engine, settings }
    }

    /// Decode, dispatch and encode one request line
    pub async fn handle_line(&self, line: &str) -> Response {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                return Response::bad_request(e.to_string());
            }
        };

        let op = envelope.request.op();
        match self.dispatch(envelope.request).await {
            Ok(result) => {
                debug!(op, "Request handled");
                Response::ok(envelope.id, result)
            }
            Err(err) => {
                warn!(op, code = err.code(), error = %err, "Request failed");
                Response::from_error(envelope.id, &err)
            }
        }
    }

    pub async fn dispatch(&self, request: Request) -> TriageResult<Value> {
        let engine = &self.engine;
        match request {
            Request::SubmitReport { report } => to_json(&engine.submit_report(report).await?),
            Request::SubmitProof { proof } => to_json(&engine.submit_proof(proof).await?),
            Request::ResolveManualReview {
                issue_id,
                category,
                actor,
            } => issue_json(&engine.resolve_manual_review(&issue_id, category, actor).await?),
            Request::Assign {
                issue_id,
                department,
                actor,
            } => issue_json(&engine.assign(&issue_id, department, actor).await?),
            Request::StartWork { issue_id, actor } => {
                issue_json(&engine.start_work(&issue_id, actor).await?)
            }
            Request::Cancel {
                issue_id,
                actor,
                reason,
            } => issue_json(&engine.cancel(&issue_id, actor, reason).await?),
            Request::OverrideSeverity {
                issue_id,
                severity,
                actor,
                reason,
            } => issue_json(
                &engine
                    .override_severity(&issue_id, severity, actor, reason)
                    .await?,
            ),
            Request::DisputeResolution {
                issue_id,
                actor,
                reason,
            } => issue_json(&engine.dispute_resolution(&issue_id, actor, reason).await?),
            Request::Feedback {
                issue_id,
                submitter_id,
                feedback,
            } => issue_json(
                &engine
                    .record_feedback(&issue_id, submitter_id, feedback)
                    .await?,
            ),
            Request::GetIssue { issue_id } => {
                let issue = engine.registry().get(&issue_id)?;
                issue_json(&issue)
            }
            Request::IssueReports { issue_id } => {
                let reports = engine.registry().reports_of(&issue_id)?;
                let plain: Vec<&Report> = reports.iter().map(|r| r.as_ref()).collect();
                to_json(&plain)
            }
            Request::Dashboard { view } => {
                let dashboard = engine.dashboard(Utc::now())?;
                render_view(&dashboard, view)
            }
            Request::Events { issue_id } => {
                let history = engine
                    .events()
                    .history()
                    .ok_or_else(|| TriageError::validation("event history is disabled"))?;
                match issue_id {
                    Some(issue_id) => to_json(&history.get_issue_events(&issue_id)),
                    None => to_json(&history.stats()),
                }
            }
            Request::CloseDue => to_json(&engine.close_due(Utc::now()).await?),
            Request::Recalibrate => to_json(&engine.recalibrate_weights()?),
            Request::ReloadConfig => {
                let path = self
                    .settings
                    .config_path
                    .as_ref()
                    .ok_or_else(|| TriageError::validation("daemon was started without a config file"))?;
                let version = engine.config().reload_from_path(path)?;
                Ok(json!({ "version": version }))
            }
            Request::SaveSnapshot => {
                let issues = persist(engine, &self.settings.snapshot_path)?;
                Ok(json!({
                    "issues": issues,
                    "path": self.settings.snapshot_path.display().to_string(),
                }))
            }
        }
    }
}

/// Write the registry to disk; returns the number of issues saved
pub fn persist(engine: &TriageOrchestrator, path: &Path) -> TriageResult<usize> {
    let snapshot = engine.snapshot()?;
    let issues = snapshot.issues.len();
    save_snapshot(&snapshot, path)?;
    Ok(issues)
}

fn render_view(dashboard: &Dashboard, view: DashboardView) -> TriageResult<Value> {
    match view {
        DashboardView::Overview => to_json(&dashboard.overview()),
        DashboardView::ByDepartment { department } => {
            issues_json(&dashboard.by_department(&department))
        }
        DashboardView::SlaBreaches => issues_json(&dashboard.sla_breaches()),
        DashboardView::ByCategory { category } => issues_json(&dashboard.by_category(&category)),
        DashboardView::ByState { state } => issues_json(&dashboard.by_state(state)),
        DashboardView::Hotspots {
            cell_size_m,
            min_issues,
        } => to_json(&dashboard.hotspots(cell_size_m, min_issues)),
        DashboardView::CategoryPerformance => to_json(&dashboard.category_performance()),
        DashboardView::JurisdictionPerformance => to_json(&dashboard.jurisdiction_performance()),
        DashboardView::TimeSeries { days } => to_json(&dashboard.time_series(days)),
        DashboardView::Urgent { limit } => to_json(&dashboard.urgent(limit)),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> TriageResult<Value> {
    serde_json::to_value(value).map_err(|e| TriageError::Internal {
        message: format!("failed to encode response: {}", e),
    })
}

fn issue_json(issue: &Arc<Issue>) -> TriageResult<Value> {
    to_json(issue.as_ref())
}

fn issues_json(issues: &[Arc<Issue>]) -> TriageResult<Value> {
    let plain: Vec<&Issue> = issues.iter().map(|i| i.as_ref()).collect();
    to_json(&plain)
}
