//! Property-Based Tests for Quantization and Geometry
//!
//! # Test Properties
//!
//! 1. **Idempotence**: quantizing a quantized value changes nothing
//! 2. **Bounded error**: quantization moves a point by at most half a cell
//! 3. **Neighborhood**: any point within the cache radius of another lies in
//!    one of its 9 neighbor cells and passes the box pre-filter
//! 4. **Metric**: haversine is symmetric and non-negative

#![cfg(test)]

use proptest::prelude::*;

use super::quantize::{haversine_m, quantize, within_box, GridCell, CELL_DEG, M_PER_DEG_LAT};

// =============================================================================
// Property Strategies
// =============================================================================

/// Latitudes away from the poles, where the grid is well-behaved.
fn lat_strategy() -> impl Strategy<Value = f64> {
    -85.0f64..85.0
}

fn lon_strategy() -> impl Strategy<Value = f64> {
    -179.0f64..179.0
}

/// Offsets in meters small enough to move at most one cell per axis
/// below 60 degrees of latitude.
fn offset_strategy() -> impl Strategy<Value = (f64, f64)> {
    (-8.0f64..8.0, -8.0f64..8.0)
}

// =============================================================================
// Quantization Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_quantize_idempotent(x in -180.0f64..180.0) {
        let q = quantize(x);
        prop_assert_eq!(quantize(q), q);
    }

    #[test]
    fn prop_quantize_error_bounded(x in -180.0f64..180.0) {
        prop_assert!((quantize(x) - x).abs() <= CELL_DEG / 2.0 + 1e-12);
    }

    #[test]
    fn prop_cell_matches_quantized_value(lat in lat_strategy(), lon in lon_strategy()) {
        let cell = GridCell::of(lat, lon);
        prop_assert_eq!(cell, GridCell::of(quantize(lat), quantize(lon)));
    }
}

// =============================================================================
// Geometry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_haversine_symmetric(
        lat1 in lat_strategy(), lon1 in lon_strategy(),
        lat2 in lat_strategy(), lon2 in lon_strategy(),
    ) {
        let d1 = haversine_m(lat1, lon1, lat2, lon2);
        let d2 = haversine_m(lat2, lon2, lat1, lon1);
        prop_assert!(d1 >= 0.0);
        prop_assert!((d1 - d2).abs() < 1e-6);
    }

    #[test]
    fn prop_close_points_share_neighborhood(
        lat in -60.0f64..60.0,
        lon in lon_strategy(),
        (dy, dx) in offset_strategy(),
    ) {
        let lat = quantize(lat);
        let lon = quantize(lon);
        let lat2 = quantize(lat + dy / M_PER_DEG_LAT);
        let lon2 = quantize(lon + dx / (M_PER_DEG_LAT * lat.to_radians().cos()));

        let d = haversine_m(lat, lon, lat2, lon2);
        prop_assume!(d < 20.0);

        prop_assert!(within_box(lat, lon, lat2, lon2, 20.0));
        prop_assert!(GridCell::of(lat, lon).neighbors().contains(&GridCell::of(lat2, lon2)));
    }
}
