//! Routing Table
//!
//! Maps `(category, location)` to a department by finding the first
//! configured jurisdiction whose boundary polygon contains the location,
//! then looking the category up in that jurisdiction's department table.

use serde::{Deserialize, Serialize};

use crate::config::{JurisdictionConfig, RoutingConfig, TriageConfig};
use crate::model::{Category, DepartmentId, GeoPoint, UNASSIGNED_QUEUE};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("No jurisdiction covers {0}")]
    NoJurisdiction(GeoPoint),

    #[error("Report has no location to route by")]
    MissingLocation,
}

pub type RoutingResult<T> = Result<T, RoutingError>;

/// Where an issue is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAssignment {
    pub department: DepartmentId,
    pub jurisdiction: Option<String>,
}

impl RouteAssignment {
    /// The fallback queue for issues no jurisdiction claims
    pub fn unassigned() -> Self {
        Self {
            department: UNASSIGNED_QUEUE.to_string(),
            jurisdiction: None,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.department == UNASSIGNED_QUEUE
    }
}

/// Routing view over one configuration snapshot
#[derive(Debug, Clone, Copy)]
pub struct RoutingTable<'a> {
    config: &'a RoutingConfig,
}

impl<'a> RoutingTable<'a> {
    pub fn new(config: &'a RoutingConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &'a TriageConfig) -> Self {
        Self::new(&config.routing)
    }

    /// Department for a category at a location
    pub fn route(&self, category: &Category, location: Option<&GeoPoint>) -> RoutingResult<RouteAssignment> {
        let point = location.ok_or(RoutingError::MissingLocation)?;
        let jurisdiction = self
            .jurisdiction_for(point)
            .ok_or(RoutingError::NoJurisdiction(*point))?;
        let department = jurisdiction
            .departments
            .get(category)
            .unwrap_or(&jurisdiction.default_department)
            .clone();
        Ok(RouteAssignment {
            department,
            jurisdiction: Some(jurisdiction.name.clone()),
        })
    }

    /// First jurisdiction, in configuration order, containing `point`
    pub fn jurisdiction_for(&self, point: &GeoPoint) -> Option<&'a JurisdictionConfig> {
        self.config
            .jurisdictions
            .iter()
            .find(|j| contains(&j.boundary, point))
    }
}

/// Even-odd ray casting over a polygon given as (lat, lon) vertices.
/// Points exactly on an edge count as inside.
pub fn contains(polygon: &[GeoPoint], point: &GeoPoint) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (x, y) = (point.lon, point.lat);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].lon, polygon[i].lat);
        let (xj, yj) = (polygon[j].lon, polygon[j].lat);
        if on_segment((xi, yi), (xj, yj), (x, y)) {
            return true;
        }
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    const EPS: f64 = 1e-12;
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    if cross.abs() > EPS {
        return false;
    }
    p.0 >= a.0.min(b.0) - EPS
        && p.0 <= a.0.max(b.0) + EPS
        && p.1 >= a.1.min(b.1) - EPS
        && p.1 <= a.1.max(b.1) + EPS
}
