//! Resolution proofs submitted by departments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::GeoPoint;
use super::image::ImageRef;
use super::{DepartmentId, IssueId};

/// Evidence that an issue has been fixed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionProof {
    pub issue_id: IssueId,
    pub after_image: ImageRef,
    pub submitted_at: DateTime<Utc>,
    pub location: GeoPoint,
    pub department_id: DepartmentId,
}
