//! Read-only dashboard queries
//!
//! A [`Dashboard`] is built from one consistent snapshot of the registry and
//! an evaluation instant; every query runs over that snapshot, so numbers
//! in one dashboard agree with each other.
//!
//! "Acknowledged" means a department has been assigned at some point;
//! "completed" means a resolution proof was accepted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::{CellKey, GridSpec};
use crate::model::{Category, DepartmentId, GeoPoint, Issue, IssueId, Severity, UNASSIGNED_QUEUE};
use crate::registry::{IssueRegistry, IssueState, RegistryResult};

/// Headline numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub total_issues: usize,
    pub acknowledged_issues: usize,
    pub completed_issues: usize,
    pub pending_issues: usize,
    pub manual_review: usize,
    pub sla_breached: usize,
    /// Completed as a percentage of acknowledged
    pub completion_rate: f64,
    /// Acknowledged as a percentage of all issues
    pub acknowledgment_rate: f64,
    pub avg_upvotes: f64,
}

/// Per-group performance (category or jurisdiction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPerformance {
    pub key: String,
    pub total_issues: usize,
    pub acknowledged: usize,
    pub completed: usize,
    pub completion_rate: f64,
    pub acknowledgment_rate: f64,
    pub total_upvotes: u64,
    pub avg_upvotes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub issues_reported: usize,
    pub issues_acknowledged: usize,
    pub issues_completed: usize,
}

/// Grid cell with an unusual concentration of live issues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub cell: CellKey,
    /// Mean location of the issues in the cell
    pub center: GeoPoint,
    pub issue_count: usize,
    pub report_count: usize,
    pub top_category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgentIssue {
    pub issue_id: IssueId,
    pub summary: String,
    pub category: Category,
    pub jurisdiction: Option<String>,
    pub department: DepartmentId,
    pub state: IssueState,
    pub severity: Severity,
    pub upvotes: u32,
    pub days_pending: f64,
}

/// Query surface over a registry snapshot
#[derive(Debug, Clone)]
pub struct Dashboard {
    issues: Vec<Arc<Issue>>,
    at: DateTime<Utc>,
}

fn acknowledged(issue: &Issue) -> bool {
    issue.assigned_at.is_some()
}

fn completed(issue: &Issue) -> bool {
    issue.accepted_proof.is_some()
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl Dashboard {
    pub fn new(issues: Vec<Arc<Issue>>, at: DateTime<Utc>) -> Self {
        Self { issues, at }
    }

    pub fn from_registry(registry: &IssueRegistry, at: DateTime<Utc>) -> RegistryResult<Self> {
        Ok(Self::new(registry.all()?, at))
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn issues(&self) -> &[Arc<Issue>] {
        &self.issues
    }

    /// Every issue queued to a department, oldest first
    pub fn by_department(&self, department: &str) -> Vec<Arc<Issue>> {
        self.select(|i| i.department == department)
    }

    /// Issues past their SLA deadline and not yet resolved, most overdue first
    pub fn sla_breaches(&self) -> Vec<Arc<Issue>> {
        let mut breached = self.select(|i| i.is_sla_breached(self.at));
        breached.sort_by_key(|i| i.sla_deadline);
        breached
    }

    pub fn by_category(&self, category: &Category) -> Vec<Arc<Issue>> {
        self.select(|i| &i.category == category)
    }

    pub fn by_state(&self, state: IssueState) -> Vec<Arc<Issue>> {
        self.select(|i| i.state == state)
    }

    fn select(&self, keep: impl Fn(&Issue) -> bool) -> Vec<Arc<Issue>> {
        self.issues.iter().filter(|i| keep(i)).cloned().collect()
    }

    /// Cells of a `cell_size_m` grid holding at least `min_issues` live,
    /// unresolved issues, busiest first
    pub fn hotspots(&self, cell_size_m: f64, min_issues: usize) -> Vec<Hotspot> {
        let grid = GridSpec::new(cell_size_m);
        let mut cells: BTreeMap<CellKey, Vec<&Issue>> = BTreeMap::new();
        let live = self
            .issues
            .iter()
            .filter(|i| !i.is_terminal() && i.state != IssueState::Resolved);
        for issue in live {
            if let Some(centroid) = &issue.location {
                cells.entry(grid.cell_of(&centroid.point)).or_default().push(issue);
            }
        }

        let mut hotspots: Vec<Hotspot> = cells
            .into_iter()
            .filter(|(_, issues)| !issues.is_empty() && issues.len() >= min_issues)
            .map(|(cell, issues)| {
                let n = issues.len() as f64;
                let (lat, lon) = issues.iter().fold((0.0, 0.0), |(lat, lon), i| {
                    let p = i.location.map(|c| c.point).unwrap_or(GeoPoint::new(0.0, 0.0));
                    (lat + p.lat, lon + p.lon)
                });
                let mut counts: BTreeMap<&Category, usize> = BTreeMap::new();
                for issue in &issues {
                    *counts.entry(&issue.category).or_insert(0) += 1;
                }
                // Highest count; BTreeMap order breaks ties alphabetically
                let top_category = counts
                    .iter()
                    .fold(None::<(&Category, usize)>, |best, (cat, count)| match best {
                        Some((_, c)) if c >= *count => best,
                        _ => Some((*cat, *count)),
                    })
                    .map(|(cat, _)| cat.clone())
                    .unwrap_or_else(Category::unclassified);
                Hotspot {
                    cell,
                    center: GeoPoint::new(lat / n, lon / n),
                    issue_count: issues.len(),
                    report_count: issues.iter().map(|i| i.contributor_count()).sum(),
                    top_category,
                }
            })
            .collect();

        hotspots.sort_by(|a, b| {
            b.issue_count
                .cmp(&a.issue_count)
                .then_with(|| b.report_count.cmp(&a.report_count))
                .then_with(|| a.cell.cmp(&b.cell))
        });
        hotspots
    }

    pub fn overview(&self) -> Overview {
        let total = self.issues.len();
        let acked = self.issues.iter().filter(|i| acknowledged(i)).count();
        let done = self.issues.iter().filter(|i| completed(i)).count();
        let upvotes: u64 = self.issues.iter().map(|i| u64::from(i.feedback.upvotes)).sum();
        Overview {
            total_issues: total,
            acknowledged_issues: acked,
            completed_issues: done,
            pending_issues: total - acked,
            manual_review: self
                .issues
                .iter()
                .filter(|i| i.state == IssueState::ManualReview)
                .count(),
            sla_breached: self.issues.iter().filter(|i| i.is_sla_breached(self.at)).count(),
            completion_rate: percentage(done, acked),
            acknowledgment_rate: percentage(acked, total),
            avg_upvotes: if total == 0 {
                0.0
            } else {
                round2(upvotes as f64 / total as f64)
            },
        }
    }

    pub fn category_performance(&self) -> Vec<GroupPerformance> {
        self.group_performance(|i| i.category.to_string())
    }

    /// Performance per jurisdiction; unrouted issues group under the
    /// unassigned queue
    pub fn jurisdiction_performance(&self) -> Vec<GroupPerformance> {
        self.group_performance(|i| {
            i.jurisdiction
                .clone()
                .unwrap_or_else(|| UNASSIGNED_QUEUE.to_string())
        })
    }

    fn group_performance(&self, key: impl Fn(&Issue) -> String) -> Vec<GroupPerformance> {
        let mut groups: HashMap<String, Vec<&Issue>> = HashMap::new();
        for issue in &self.issues {
            groups.entry(key(issue)).or_default().push(issue);
        }

        let mut rows: Vec<GroupPerformance> = groups
            .into_iter()
            .map(|(key, issues)| {
                let total = issues.len();
                let acked = issues.iter().filter(|i| acknowledged(i)).count();
                let done = issues.iter().filter(|i| completed(i)).count();
                let upvotes: u64 = issues.iter().map(|i| u64::from(i.feedback.upvotes)).sum();
                GroupPerformance {
                    key,
                    total_issues: total,
                    acknowledged: acked,
                    completed: done,
                    completion_rate: percentage(done, acked),
                    acknowledgment_rate: percentage(acked, total),
                    total_upvotes: upvotes,
                    avg_upvotes: round2(upvotes as f64 / total as f64),
                }
            })
            .collect();
        rows.sort_by(|a, b| b.total_issues.cmp(&a.total_issues).then_with(|| a.key.cmp(&b.key)));
        rows
    }

    /// Daily counts of issues created in the last `days` days, by creation
    /// date, oldest first. Days without issues are omitted.
    pub fn time_series(&self, days: u32) -> Vec<DailyCount> {
        let start = (self.at - Duration::days(i64::from(days))).date_naive();
        let mut by_day: BTreeMap<NaiveDate, DailyCount> = BTreeMap::new();
        for issue in &self.issues {
            let date = issue.created_at.date_naive();
            if date < start || issue.created_at > self.at {
                continue;
            }
            let row = by_day.entry(date).or_insert(DailyCount {
                date,
                issues_reported: 0,
                issues_acknowledged: 0,
                issues_completed: 0,
            });
            row.issues_reported += 1;
            row.issues_acknowledged += usize::from(acknowledged(issue));
            row.issues_completed += usize::from(completed(issue));
        }
        by_day.into_values().collect()
    }

    /// Live, unresolved issues ordered by severity, then upvotes, then age
    pub fn urgent(&self, limit: usize) -> Vec<UrgentIssue> {
        let mut live: Vec<&Arc<Issue>> = self
            .issues
            .iter()
            .filter(|i| !i.is_terminal() && i.state != IssueState::Resolved)
            .collect();
        live.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.feedback.upvotes.cmp(&a.feedback.upvotes))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        live.into_iter()
            .take(limit)
            .map(|issue| UrgentIssue {
                issue_id: issue.id.clone(),
                summary: issue.summary.clone(),
                category: issue.category.clone(),
                jurisdiction: issue.jurisdiction.clone(),
                department: issue.department.clone(),
                state: issue.state,
                severity: issue.severity,
                upvotes: issue.feedback.upvotes,
                days_pending: round1((self.at - issue.created_at).num_seconds() as f64 / 86_400.0),
            })
            .collect()
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
