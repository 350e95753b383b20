//! Fixed-size spatial grid used to partition the dedup index

use serde::{Deserialize, Serialize};

use crate::model::geo::METERS_PER_DEGREE;
use crate::model::GeoPoint;

/// Grid cell coordinates (row from latitude, column from longitude)
pub type CellKey = (i64, i64);

/// Most cells spanned in one direction before a query covers every cell
pub const MAX_SPAN: i64 = 32;

/// Cells a neighbourhood query has to visit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Neighbourhood {
    /// Sorted so callers can lock them in a consistent order
    Cells(Vec<CellKey>),
    /// The radius reaches past [`MAX_SPAN`] cells (a radius raised by a
    /// reload, or a point near a pole); every cell qualifies
    Everywhere,
}

impl Neighbourhood {
    pub fn contains(&self, cell: &CellKey) -> bool {
        match self {
            Self::Cells(cells) => cells.binary_search(cell).is_ok(),
            Self::Everywhere => true,
        }
    }
}

/// Equal-angle grid over latitude/longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    cell_size_m: f64,
    cell_deg: f64,
}

impl GridSpec {
    /// Grid whose cells are `cell_size_m` tall (narrower towards the poles)
    pub fn new(cell_size_m: f64) -> Self {
        let cell_size_m = if cell_size_m.is_finite() && cell_size_m > 1.0 {
            cell_size_m
        } else {
            1.0
        };
        Self {
            cell_size_m,
            cell_deg: cell_size_m / METERS_PER_DEGREE,
        }
    }

    pub fn cell_size_m(&self) -> f64 {
        self.cell_size_m
    }

    pub fn cell_of(&self, point: &GeoPoint) -> CellKey {
        (
            (point.lat / self.cell_deg).floor() as i64,
            (point.lon / self.cell_deg).floor() as i64,
        )
    }

    /// Every cell that may contain a point within `radius_m` of `point`
    pub fn neighbourhood(&self, point: &GeoPoint, radius_m: f64) -> Neighbourhood {
        let (row, col) = self.cell_of(point);
        // A degree of longitude shrinks with cos(lat)
        let lon_cell_m = self.cell_size_m * point.lat.to_radians().cos().max(0.01);
        let lat_span = (radius_m / self.cell_size_m).ceil().max(1.0);
        let lon_span = (radius_m / lon_cell_m).ceil().max(1.0);
        if !(lat_span <= MAX_SPAN as f64 && lon_span <= MAX_SPAN as f64) {
            return Neighbourhood::Everywhere;
        }
        let (lat_span, lon_span) = (lat_span as i64, lon_span as i64);

        let mut cells = Vec::with_capacity(((2 * lat_span + 1) * (2 * lon_span + 1)) as usize);
        for dr in -lat_span..=lat_span {
            for dc in -lon_span..=lon_span {
                cells.push((row + dr, col + dc));
            }
        }
        cells.sort_unstable();
        Neighbourhood::Cells(cells)
    }
}
