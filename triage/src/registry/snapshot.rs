//! Registry snapshots
//!
//! Captures every issue plus every accepted report as one JSON file.
//! Saving writes a temp file and renames it over the target, keeping the
//! previous file as `.backup`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{IssueRegistry, IssueSlot, Ownership, RegistryError, RegistryResult};
use crate::model::{Issue, IssueId, Report};

/// Error type for snapshot persistence
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot at {path} is corrupted: {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("Snapshot is inconsistent: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub issues: Vec<Issue>,
    /// Every accepted report, grouped by issue in contributor order
    pub reports: Vec<Report>,
    pub next_seq: u64,
    pub taken_at: DateTime<Utc>,
}

impl IssueRegistry {
    /// Capture every issue and its reports. Each issue is internally
    /// consistent; issues mutated during the capture may reflect either
    /// side of the mutation.
    pub fn snapshot(&self) -> RegistryResult<RegistrySnapshot> {
        let issues: Vec<Issue> = self
            .all()?
            .into_iter()
            .map(|issue| (*issue).clone())
            .collect();
        let reports = {
            let owners = self.owners.read().map_err(|_| RegistryError::LockPoisoned)?;
            issues
                .iter()
                .flat_map(|issue| issue.reports.iter())
                .filter_map(|id| owners.accepted.get(id))
                .map(|report| (**report).clone())
                .collect()
        };
        Ok(RegistrySnapshot {
            issues,
            reports,
            next_seq: self.next_seq.load(Ordering::Acquire),
            taken_at: Utc::now(),
        })
    }

    /// Build a registry from a snapshot.
    ///
    /// Every contributor of every issue must come with its report record.
    /// Fingerprints are reclaimed for live issues only.
    pub fn restore(snapshot: RegistrySnapshot) -> Result<Self, SnapshotError> {
        let mut owners = Ownership::default();
        let mut live: HashMap<IssueId, bool> = HashMap::new();
        let mut slots = HashMap::new();
        let mut max_seq = 0;

        for issue in snapshot.issues {
            if issue.reports.is_empty() {
                return Err(SnapshotError::Inconsistent(format!(
                    "issue {} has no contributing reports",
                    issue.id
                )));
            }
            for report_id in &issue.reports {
                if let Some(other) = owners.reports.insert(report_id.clone(), issue.id.clone()) {
                    return Err(SnapshotError::Inconsistent(format!(
                        "report {} claimed by both {} and {}",
                        report_id, other, issue.id
                    )));
                }
            }
            max_seq = max_seq.max(issue.seq);
            live.insert(issue.id.clone(), !issue.is_terminal());
            let id = issue.id.clone();
            if slots.insert(id.clone(), Arc::new(IssueSlot::new(issue))).is_some() {
                return Err(SnapshotError::Inconsistent(format!("duplicate issue {}", id)));
            }
        }

        for report in snapshot.reports {
            let Some(issue_id) = owners.reports.get(&report.id).cloned() else {
                return Err(SnapshotError::Inconsistent(format!(
                    "report {} is not a contributor of any issue",
                    report.id
                )));
            };
            if live.get(&issue_id).copied().unwrap_or(false) {
                owners.fingerprints.insert(report.fingerprint(), issue_id);
            }
            if owners
                .accepted
                .insert(report.id.clone(), Arc::new(report))
                .is_some()
            {
                return Err(SnapshotError::Inconsistent("duplicate report record".into()));
            }
        }
        if let Some((report_id, issue_id)) = owners
            .reports
            .iter()
            .find(|(report_id, _)| !owners.accepted.contains_key(*report_id))
        {
            return Err(SnapshotError::Inconsistent(format!(
                "issue {} lists report {} with no record",
                issue_id, report_id
            )));
        }

        let registry = IssueRegistry::new();
        registry
            .next_seq
            .store(snapshot.next_seq.max(max_seq + 1), Ordering::Release);
        *registry
            .owners
            .write()
            .map_err(|_| RegistryError::LockPoisoned)? = owners;
        *registry
            .slots
            .write()
            .map_err(|_| RegistryError::LockPoisoned)? = slots;
        Ok(registry)
    }
}

/// Write a snapshot atomically
pub fn save_snapshot(snapshot: &RegistrySnapshot, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    let backup_path = path.with_extension("json.backup");
    let temp_path = path.with_extension("json.tmp");
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };

    if path.exists() {
        if let Err(e) = std::fs::copy(path, &backup_path) {
            warn!(path = %backup_path.display(), error = %e, "Failed to back up snapshot");
        }
    }

    let content = serde_json::to_string_pretty(snapshot).map_err(|e| SnapshotError::Corrupted {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    std::fs::write(&temp_path, content).map_err(io_err)?;
    std::fs::rename(&temp_path, path).map_err(io_err)?;

    info!(
        path = %path.display(),
        issues = snapshot.issues.len(),
        "Registry snapshot saved"
    );
    Ok(())
}

/// Read a snapshot; `Ok(None)` if the file does not exist.
///
/// A corrupted primary file falls back to the `.backup` copy.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Option<RegistrySnapshot>, SnapshotError> {
    let path = path.as_ref();
    match read_snapshot(path) {
        Ok(found) => Ok(found),
        Err(corrupted @ SnapshotError::Corrupted { .. }) => {
            let backup_path = path.with_extension("json.backup");
            warn!(
                path = %path.display(),
                error = %corrupted,
                "Snapshot corrupted, trying backup"
            );
            match read_snapshot(&backup_path)? {
                Some(snapshot) => Ok(Some(snapshot)),
                None => Err(corrupted),
            }
        }
        Err(e) => Err(e),
    }
}

fn read_snapshot(path: &Path) -> Result<Option<RegistrySnapshot>, SnapshotError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SnapshotError::Corrupted {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Signature;
    use crate::model::{
        Category, Centroid, Channel, FeedbackTally, GeoPoint, Report, ReportInput,
        ReportedLocation, Severity,
    };
    use crate::registry::IssueState;

    fn seeded_registry() -> (IssueRegistry, Report) {
        let registry = IssueRegistry::new();
        let now = Utc::now();
        let report = Report::from_input(
            ReportInput {
                text: "broken streetlight".into(),
                image: None,
                location: Some(ReportedLocation::new(GeoPoint::new(12.97, 77.59))),
                channel: Channel::Mobile,
                submitter_id: "c-1".into(),
            },
            now,
        );
        let issue = Issue {
            id: "issue-1".into(),
            seq: registry.next_seq(),
            category: Category::new("streetlight"),
            location: report.location.as_ref().map(Centroid::from_location),
            jurisdiction: Some("central".into()),
            severity: Severity::new(2).unwrap(),
            reports: vec![report.id.clone()],
            signature: Signature::from_text(&report.text),
            summary: report.text.clone(),
            department: "electrical".into(),
            state: IssueState::Assigned,
            sla_deadline: now + chrono::Duration::hours(120),
            feedback: FeedbackTally::default(),
            before_image: None,
            assigned_at: Some(now),
            accepted_proof: None,
            closes_at: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        registry.insert(issue, &report).unwrap();
        (registry, report)
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let (registry, report) = seeded_registry();

        save_snapshot(&registry.snapshot().unwrap(), &path).unwrap();
        let loaded = load_snapshot(&path).unwrap().expect("snapshot exists");
        let restored = IssueRegistry::restore(loaded).unwrap();

        assert_eq!(*restored.get("issue-1").unwrap(), *registry.get("issue-1").unwrap());
        assert_eq!(restored.owner_of(&report.id), Some("issue-1".to_string()));
        assert_eq!(
            restored.owner_of_fingerprint(&report.fingerprint()),
            Some("issue-1".to_string())
        );
        assert!(restored.next_seq() > 1);
        assert_eq!(restored.report(&report.id).as_deref(), Some(&report));
    }

    #[tokio::test]
    async fn test_restore_reclaims_fingerprints_of_live_issues_only() {
        let (registry, report) = seeded_registry();
        registry
            .transition("issue-1", IssueState::Cancelled, crate::registry::Actor::System, None, Utc::now())
            .await
            .unwrap();

        let restored = IssueRegistry::restore(registry.snapshot().unwrap()).unwrap();
        assert_eq!(restored.owner_of(&report.id), Some("issue-1".to_string()));
        assert_eq!(restored.owner_of_fingerprint(&report.fingerprint()), None);
        assert_eq!(restored.reports_of("issue-1").unwrap().len(), 1);
    }

    #[test]
    fn test_restore_requires_report_records() {
        let (registry, _) = seeded_registry();
        let mut snapshot = registry.snapshot().unwrap();
        snapshot.reports.clear();

        let err = IssueRegistry::restore(snapshot).err().unwrap();
        assert!(matches!(err, SnapshotError::Inconsistent(_)));
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_snapshot_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let (registry, _) = seeded_registry();

        // Second save copies the first to .backup
        save_snapshot(&registry.snapshot().unwrap(), &path).unwrap();
        save_snapshot(&registry.snapshot().unwrap(), &path).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let loaded = load_snapshot(&path).unwrap().expect("backup exists");
        assert_eq!(loaded.issues.len(), 1);
    }

    #[test]
    fn test_restore_rejects_double_claim() {
        let (registry, _) = seeded_registry();
        let mut snapshot = registry.snapshot().unwrap();
        let mut twin = snapshot.issues[0].clone();
        twin.id = "issue-2".into();
        snapshot.issues.push(twin);

        let err = IssueRegistry::restore(snapshot).err().unwrap();
        assert!(matches!(err, SnapshotError::Inconsistent(_)));
    }
}
