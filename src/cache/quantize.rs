//! Coordinate Quantization and Geometry
//!
//! Raw coordinates are validated, snapped to a 4-decimal grid (~11 m) and
//! mapped to integer [`GridCell`]s. Two points in the same cell are only
//! candidates for a cache hit; a hit is confirmed with the great-circle
//! distance.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal places kept by quantization
pub const DECIMALS: usize = 4;

/// Cells per degree
pub const SCALE: f64 = 10_000.0;

/// Size of one grid cell in degrees
pub const CELL_DEG: f64 = 1.0 / SCALE;

/// Mean earth radius used by the haversine formula
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude
pub const M_PER_DEG_LAT: f64 = 111_320.0;

/// Slack applied to the bounding-box pre-filter
const BOX_SLACK: f64 = 1.05;

/// Rejected coordinate input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("lat/lon must be a number")]
    Unparseable,

    #[error("lat/lon not finite")]
    NotFinite,

    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// Integer key of a grid cell (`round(q * 10^4)` per axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub lat: i64,
    pub lon: i64,
}

impl GridCell {
    /// Cell containing a coordinate
    pub fn of(lat: f64, lon: f64) -> Self {
        Self {
            lat: (quantize(lat) * SCALE).round() as i64,
            lon: (quantize(lon) * SCALE).round() as i64,
        }
    }

    /// The 3x3 neighborhood, this cell included
    pub fn neighbors(&self) -> [GridCell; 9] {
        let mut out = [*self; 9];
        let mut i = 0;
        for dlat in -1..=1 {
            for dlon in -1..=1 {
                out[i] = GridCell {
                    lat: self.lat + dlat,
                    lon: self.lon + dlon,
                };
                i += 1;
            }
        }
        out
    }
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.lat, self.lon)
    }
}

/// Snap a coordinate to the grid
#[inline]
pub fn quantize(x: f64) -> f64 {
    (x * SCALE).round() / SCALE
}

/// Reject non-finite and out-of-range coordinates
pub fn validate(lat: f64, lon: f64) -> Result<(), CoordinateError> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err(CoordinateError::NotFinite);
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CoordinateError::LatitudeOutOfRange(lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(CoordinateError::LongitudeOutOfRange(lon));
    }
    Ok(())
}

/// Key of a location in the hotness map
pub fn hot_key(lat: f64, lon: f64) -> String {
    format!("{:.*},{:.*}", DECIMALS, lat, DECIMALS, lon)
}

/// Great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let p1 = lat1.to_radians();
    let p2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dlambda / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Cheap bounding-box test run before the exact distance
pub fn within_box(lat1: f64, lon1: f64, lat2: f64, lon2: f64, radius_m: f64) -> bool {
    let box_lat = CELL_DEG.max(radius_m / M_PER_DEG_LAT * BOX_SLACK);
    let cos_lat = ((lat1 + lat2) * 0.5).to_radians().cos().max(0.2);
    let box_lon = CELL_DEG.max(radius_m / (M_PER_DEG_LAT * cos_lat) * BOX_SLACK);
    (lat1 - lat2).abs() <= box_lat && (lon1 - lon2).abs() <= box_lon
}

/// Parse a coordinate typed by a human.
///
/// Drops blanks (including NBSP, narrow and thin spaces, word joiners) and
/// apostrophes used as digit grouping, maps the Unicode minus sign, and
/// accepts a comma as decimal separator. When both `,` and `.` appear, the
/// right-most one is the decimal separator and the other groups digits.
pub fn parse_coordinate(raw: &str) -> Result<f64, CoordinateError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| {
            !matches!(
                c,
                ' ' | '\u{00A0}' | '\u{202F}' | '\u{2009}' | '\u{2007}' | '\u{2060}' | '\''
            )
        })
        .map(|c| if c == '\u{2212}' { '-' } else { c })
        .collect();

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    normalized
        .parse::<f64>()
        .map_err(|_| CoordinateError::Unparseable)
}
