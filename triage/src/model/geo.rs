//! Geographic primitives: points, noisy reported locations, weighted centroids

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres (IUGG)
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Metres per degree of latitude (close enough for city-scale grids)
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Reference accuracy used to down-weight noisy fixes
const ACCURACY_REFERENCE_M: f64 = 25.0;

/// A WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether the coordinate is finite and on the globe
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in metres (haversine)
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_phi = (other.lat - self.lat).to_radians();
        let d_lambda = (other.lon - self.lon).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lon)
    }
}

/// A location as reported by a citizen device, possibly noisy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedLocation {
    pub point: GeoPoint,
    /// Reported horizontal accuracy radius in metres, if the channel provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

impl ReportedLocation {
    pub fn new(point: GeoPoint) -> Self {
        Self {
            point,
            accuracy_m: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    /// Contribution weight when refining a centroid.
    ///
    /// A fix without accuracy metadata weighs 1.0; a 25 m fix weighs 0.5.
    pub fn weight(&self) -> f64 {
        match self.accuracy_m {
            Some(acc) if acc.is_finite() && acc > 0.0 => 1.0 / (1.0 + acc / ACCURACY_REFERENCE_M),
            _ => 1.0,
        }
    }
}

/// Canonical issue location: weighted mean of contributing report locations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub point: GeoPoint,
    /// Sum of contributing weights
    pub weight: f64,
}

impl Centroid {
    pub fn from_location(location: &ReportedLocation) -> Self {
        Self {
            point: location.point,
            weight: location.weight(),
        }
    }

    /// Fold another reported location into the centroid
    pub fn absorb(&self, location: &ReportedLocation) -> Self {
        let w = location.weight();
        let total = self.weight + w;
        Self {
            point: GeoPoint {
                lat: (self.point.lat * self.weight + location.point.lat * w) / total,
                lon: (self.point.lon * self.weight + location.point.lon * w) / total,
            },
            weight: total,
        }
    }
}
