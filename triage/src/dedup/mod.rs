//! Similarity / dedup index of open issues
//!
//! Open issues are partitioned on a fixed spatial grid. A query collects the
//! issues in the grid neighbourhood of the report, keeps those with a
//! compatible category inside the merge radius, and scores each one by
//! combining geographic proximity with token-signature similarity.
//!
//! # Consistency
//!
//! Index records are immutable `Arc<IndexEntry>` values. An update replaces
//! the whole record under the write lock, and queries clone the `Arc`s they
//! need before scoring, so a reader sees either the old or the new record of
//! an issue, never a mix of both.
//!
//! # Ordering
//!
//! Results are sorted by score descending; equal scores prefer the oldest
//! issue (lowest creation sequence) so reports keep accumulating on the
//! first-come issue.

pub mod grid;
pub mod text;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

pub use grid::{CellKey, GridSpec, Neighbourhood};
pub use text::{Signature, MAX_SIGNATURE_TOKENS};

use crate::config::DedupConfig;
use crate::model::{Category, GeoPoint, IssueId};

/// Error type for index operations
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Invalid location: {0}")]
    InvalidLocation(GeoPoint),
}

/// Result type for index operations
pub type DedupResult<T> = Result<T, DedupError>;

/// Shared reference to DedupIndex
pub type SharedDedupIndex = Arc<DedupIndex>;

/// Snapshot of one open issue as the index sees it
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub issue_id: IssueId,
    pub seq: u64,
    pub category: Category,
    pub location: GeoPoint,
    pub signature: Signature,
}

/// A scored duplicate candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub issue_id: IssueId,
    /// Combined similarity in `[0, 1]`
    pub score: f64,
    pub distance_m: f64,
    pub text_similarity: f64,
    pub seq: u64,
}

#[derive(Default)]
struct IndexInner {
    entries: HashMap<IssueId, (CellKey, Arc<IndexEntry>)>,
    cells: HashMap<CellKey, BTreeSet<IssueId>>,
}

/// Spatial + semantic index of open issues
pub struct DedupIndex {
    grid: GridSpec,
    inner: RwLock<IndexInner>,
}

impl DedupIndex {
    /// Create an index with the given grid cell size in metres
    pub fn new(cell_size_m: f64) -> Self {
        Self {
            grid: GridSpec::new(cell_size_m),
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Create a shared reference to this index
    pub fn shared(self) -> SharedDedupIndex {
        Arc::new(self)
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Insert or replace the record for an issue
    pub fn insert(
        &self,
        issue_id: &str,
        seq: u64,
        location: GeoPoint,
        category: Category,
        signature: Signature,
    ) -> DedupResult<()> {
        if !location.is_valid() {
            return Err(DedupError::InvalidLocation(location));
        }
        let cell = self.grid.cell_of(&location);
        let entry = Arc::new(IndexEntry {
            issue_id: issue_id.to_string(),
            seq,
            category,
            location,
            signature,
        });

        let mut inner = self.inner.write().map_err(|_| DedupError::LockPoisoned)?;
        if let Some((old_cell, _)) = inner.entries.get(issue_id).cloned() {
            if old_cell != cell {
                Self::detach(&mut inner, old_cell, issue_id);
            }
        }
        inner
            .cells
            .entry(cell)
            .or_default()
            .insert(issue_id.to_string());
        inner.entries.insert(issue_id.to_string(), (cell, entry));

        debug!(issue_id, ?cell, "Indexed issue");
        Ok(())
    }

    /// Remove an issue; returns whether it was present
    pub fn remove(&self, issue_id: &str) -> DedupResult<bool> {
        let mut inner = self.inner.write().map_err(|_| DedupError::LockPoisoned)?;
        match inner.entries.remove(issue_id) {
            Some((cell, _)) => {
                Self::detach(&mut inner, cell, issue_id);
                debug!(issue_id, "Removed issue from index");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn detach(inner: &mut IndexInner, cell: CellKey, issue_id: &str) {
        if let Some(ids) = inner.cells.get_mut(&cell) {
            ids.remove(issue_id);
            if ids.is_empty() {
                inner.cells.remove(&cell);
            }
        }
    }

    /// Current record for an issue
    pub fn get(&self, issue_id: &str) -> DedupResult<Option<Arc<IndexEntry>>> {
        let inner = self.inner.read().map_err(|_| DedupError::LockPoisoned)?;
        Ok(inner.entries.get(issue_id).map(|(_, e)| e.clone()))
    }

    pub fn contains(&self, issue_id: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.entries.contains_key(issue_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record
    pub fn clear(&self) -> DedupResult<()> {
        let mut inner = self.inner.write().map_err(|_| DedupError::LockPoisoned)?;
        inner.entries.clear();
        inner.cells.clear();
        Ok(())
    }

    /// Find duplicate candidates for a report.
    ///
    /// Returns every compatible issue within `policy.radius_m`, scored and
    /// ordered; the caller applies the merge threshold.
    pub fn query(
        &self,
        location: &GeoPoint,
        categories: &[Category],
        signature: &Signature,
        policy: &DedupConfig,
    ) -> DedupResult<Vec<Candidate>> {
        if !location.is_valid() {
            return Err(DedupError::InvalidLocation(*location));
        }

        let neighbourhood = self.grid.neighbourhood(location, policy.radius_m);
        let nearby: Vec<Arc<IndexEntry>> = {
            let inner = self.inner.read().map_err(|_| DedupError::LockPoisoned)?;
            match &neighbourhood {
                Neighbourhood::Cells(cells) => cells
                    .iter()
                    .filter_map(|cell| inner.cells.get(cell))
                    .flatten()
                    .filter_map(|id| inner.entries.get(id).map(|(_, e)| e.clone()))
                    .filter(|e| categories.contains(&e.category))
                    .collect(),
                Neighbourhood::Everywhere => {
                    debug!(radius_m = policy.radius_m, "Radius exceeds grid span; scanning every entry");
                    inner
                        .entries
                        .values()
                        .map(|(_, e)| e.clone())
                        .filter(|e| categories.contains(&e.category))
                        .collect()
                }
            }
        };

        let weight_sum = policy.geo_weight + policy.text_weight;
        let mut candidates: Vec<Candidate> = nearby
            .into_iter()
            .filter_map(|entry| {
                let distance_m = location.distance_m(&entry.location);
                if distance_m > policy.radius_m {
                    return None;
                }
                let proximity = 1.0 - distance_m / policy.radius_m;
                let text_similarity = signature.similarity(&entry.signature);
                let score = (policy.geo_weight * proximity + policy.text_weight * text_similarity)
                    / weight_sum;
                Some(Candidate {
                    issue_id: entry.issue_id.clone(),
                    score,
                    distance_m,
                    text_similarity,
                    seq: entry.seq,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.seq.cmp(&b.seq))
                .then_with(|| a.issue_id.cmp(&b.issue_id))
        });

        debug!(
            %location,
            candidates = candidates.len(),
            best = candidates.first().map(|c| c.score),
            "Dedup query"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DedupConfig {
        DedupConfig {
            radius_m: 500.0,
            merge_threshold: 0.55,
            geo_weight: 0.5,
            text_weight: 0.5,
        }
    }

    fn pothole() -> Category {
        Category::new("pothole")
    }

    #[test]
    fn test_insert_and_query() {
        let index = DedupIndex::new(500.0);
        index
            .insert(
                "issue-a",
                1,
                GeoPoint::new(12.90, 77.60),
                pothole(),
                Signature::from_text("pothole on Main St"),
            )
            .unwrap();

        let results = index
            .query(
                &GeoPoint::new(12.901, 77.601),
                &[pothole()],
                &Signature::from_text("large pothole same street"),
                &policy(),
            )
            .unwrap();

        assert_eq!(results.len(), 1);
        let best = &results[0];
        assert_eq!(best.issue_id, "issue-a");
        assert!(best.score > 0.55, "score was {}", best.score);
        assert!((best.text_similarity - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_query_filters_category_and_radius() {
        let index = DedupIndex::new(500.0);
        let sig = Signature::from_text("garbage dump");
        index
            .insert("near-other-cat", 1, GeoPoint::new(12.90, 77.60), Category::new("garbage"), sig.clone())
            .unwrap();
        index
            .insert("far-same-cat", 2, GeoPoint::new(12.95, 77.60), pothole(), sig.clone())
            .unwrap();

        let results = index
            .query(&GeoPoint::new(12.90, 77.60), &[pothole()], &sig, &policy())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_tie_prefers_oldest() {
        let index = DedupIndex::new(500.0);
        let point = GeoPoint::new(12.90, 77.60);
        let sig = Signature::from_text("broken streetlight");
        index.insert("newer", 9, point, pothole(), sig.clone()).unwrap();
        index.insert("older", 3, point, pothole(), sig.clone()).unwrap();

        let results = index.query(&point, &[pothole()], &sig, &policy()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].score, results[1].score);
        assert_eq!(results[0].issue_id, "older");
    }

    #[test]
    fn test_reinsert_moves_cell_and_replaces_record() {
        let index = DedupIndex::new(100.0);
        let sig = Signature::from_text("pothole");
        index.insert("a", 1, GeoPoint::new(10.0, 10.0), pothole(), sig.clone()).unwrap();
        index.insert("a", 1, GeoPoint::new(10.01, 10.0), pothole(), sig.clone()).unwrap();

        assert_eq!(index.len(), 1);
        let near_old = index
            .query(&GeoPoint::new(10.0, 10.0), &[pothole()], &sig, &policy())
            .unwrap();
        assert!(near_old.is_empty());
        let entry = index.get("a").unwrap().unwrap();
        assert_eq!(entry.location, GeoPoint::new(10.01, 10.0));
    }

    #[test]
    fn test_radius_raised_past_grid_still_finds_candidates() {
        let index = DedupIndex::new(100.0);
        let sig = Signature::from_text("pothole");
        index.insert("a", 1, GeoPoint::new(12.90, 77.60), pothole(), sig.clone()).unwrap();

        // ~4.4 km away: more than 32 cells of 100 m
        let wide = DedupConfig {
            radius_m: 5_000.0,
            ..policy()
        };
        let results = index
            .query(&GeoPoint::new(12.94, 77.60), &[pothole()], &sig, &wide)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].issue_id, "a");
    }

    #[test]
    fn test_remove() {
        let index = DedupIndex::new(500.0);
        let sig = Signature::from_text("pothole");
        index.insert("a", 1, GeoPoint::new(1.0, 1.0), pothole(), sig).unwrap();
        assert!(index.remove("a").unwrap());
        assert!(!index.remove("a").unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn test_invalid_location_rejected() {
        let index = DedupIndex::new(500.0);
        let err = index
            .insert("a", 1, GeoPoint::new(100.0, 0.0), pothole(), Signature::default())
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidLocation(_)));
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_records() {
        use std::thread;

        let index = Arc::new(DedupIndex::new(500.0));
        let a = (GeoPoint::new(12.90, 77.60), Signature::from_text("alpha"));
        let b = (GeoPoint::new(12.9001, 77.6001), Signature::from_text("beta"));
        index.insert("x", 1, a.0, pothole(), a.1.clone()).unwrap();

        let writer = {
            let index = index.clone();
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for i in 0..2_000 {
                    let (p, s) = if i % 2 == 0 { &b } else { &a };
                    index.insert("x", 1, *p, pothole(), s.clone()).unwrap();
                }
            })
        };

        for _ in 0..2_000 {
            let entry = index.get("x").unwrap().unwrap();
            let consistent = (entry.location == a.0 && entry.signature == a.1)
                || (entry.location == b.0 && entry.signature == b.1);
            assert!(consistent, "torn record observed");
        }
        writer.join().unwrap();
    }
}
