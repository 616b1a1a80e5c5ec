//! # Geographic Utilities
//!
//! Geometry primitives shared by the store, the clusterer and the sampler.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`is_valid_coordinate`] | Reject NaN, infinite or out-of-range lat/lng pairs |
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Total length of a trace in meters |
//! | [`compute_bounds`] | Bounding box of a set of points |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//! | [`round_coordinate`] | Fixed-precision rounding used for cache keys |
//!
//! ## Example
//!
//! ```rust
//! use fleet_tracker::{GpsPoint, geo_utils};
//!
//! let depot = GpsPoint::new(41.0000, 29.0000);
//! let gate = GpsPoint::new(41.0001, 29.0001);
//!
//! assert!(geo_utils::is_valid_coordinate(depot.latitude, depot.longitude));
//! let dist = geo_utils::haversine_distance(&depot, &gate);
//! assert!(dist > 10.0 && dist < 20.0);
//! ```
//!
//! ## Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).
//! Distances use the Haversine formula on a spherical Earth (mean radius
//! 6,371 km), accurate to within 0.3% at fleet scales.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint};

// =============================================================================
// Validation
// =============================================================================

/// Check that a latitude/longitude pair is usable.
///
/// Rejects non-finite values and anything outside `[-90, 90]` latitude or
/// `[-180, 180]` longitude. `(0.0, 0.0)` is a valid coordinate.
#[inline]
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points in meters.
///
/// # Example
///
/// ```rust
/// use fleet_tracker::{GpsPoint, geo_utils};
///
/// let istanbul = GpsPoint::new(41.0082, 28.9784);
/// let ankara = GpsPoint::new(39.9334, 32.8597);
///
/// let distance = geo_utils::haversine_distance(&istanbul, &ankara);
/// assert!((distance - 350_000.0).abs() < 10_000.0); // ~350 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a trace in meters. Empty or single-point traces return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert meters to approximate degrees of longitude at a given latitude.
///
/// The value is also an upper bound on the latitude span, so it can be used
/// for square search envelopes. The cosine is clamped at 0.1, so the
/// result is meaningless within ~6° of the poles.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Bounding Box / Rounding
// =============================================================================

/// Bounding box of a set of points, or `None` for empty input.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    if points.is_empty() {
        return None;
    }

    let mut min_lat = f64::MAX;
    let mut max_lat = f64::MIN;
    let mut min_lng = f64::MAX;
    let mut max_lng = f64::MIN;

    for p in points {
        min_lat = min_lat.min(p.latitude);
        max_lat = max_lat.max(p.latitude);
        min_lng = min_lng.min(p.longitude);
        max_lng = max_lng.max(p.longitude);
    }

    Some(Bounds { min_lat, max_lat, min_lng, max_lng })
}

/// Round a coordinate component to `decimals` places and return it as a
/// scaled integer, so it can be hashed and compared exactly.
///
/// Four decimals is roughly 11 m at the equator.
#[inline]
pub fn round_coordinate(value: f64, decimals: u32) -> i64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() as i64
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_valid_coordinates() {
        assert!(is_valid_coordinate(41.0, 29.0));
        assert!(is_valid_coordinate(0.0, 0.0));
        assert!(is_valid_coordinate(-90.0, 180.0));
        assert!(is_valid_coordinate(90.0, -180.0));
    }

    #[test]
    fn test_invalid_coordinates() {
        assert!(!is_valid_coordinate(200.0, 29.0));
        assert!(!is_valid_coordinate(41.0, -180.5));
        assert!(!is_valid_coordinate(f64::NAN, 29.0));
        assert!(!is_valid_coordinate(41.0, f64::INFINITY));
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(41.0, 29.0);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_small_offset() {
        // 0.0001 deg in both axes at 41N is roughly 14m
        let a = GpsPoint::new(41.00000, 29.00000);
        let b = GpsPoint::new(41.00010, 29.00010);
        let dist = haversine_distance(&a, &b);
        assert!(approx_eq(dist, 13.6, 1.5), "got {}", dist);
    }

    #[test]
    fn test_polyline_length() {
        assert_eq!(polyline_length(&[]), 0.0);
        assert_eq!(polyline_length(&[GpsPoint::new(41.0, 29.0)]), 0.0);

        let track = vec![
            GpsPoint::new(41.000, 29.0),
            GpsPoint::new(41.001, 29.0),
            GpsPoint::new(41.002, 29.0),
        ];
        let length = polyline_length(&track);
        assert!(approx_eq(length, 222.4, 2.0), "got {}", length);
    }

    #[test]
    fn test_compute_bounds() {
        assert!(compute_bounds(&[]).is_none());

        let bounds = compute_bounds(&[
            GpsPoint::new(41.00, 29.03),
            GpsPoint::new(41.01, 29.02),
            GpsPoint::new(41.005, 29.025),
        ])
        .unwrap();
        assert_eq!(bounds.min_lat, 41.00);
        assert_eq!(bounds.max_lat, 41.01);
        assert_eq!(bounds.min_lng, 29.02);
        assert_eq!(bounds.max_lng, 29.03);
    }

    #[test]
    fn test_meters_to_degrees() {
        let deg = meters_to_degrees(111_320.0, 0.0);
        assert!(approx_eq(deg, 1.0, 0.01));

        // Further from the equator the same distance spans more degrees
        assert!(meters_to_degrees(111_320.0, 45.0) > 1.0);
    }

    #[test]
    fn test_round_coordinate() {
        assert_eq!(round_coordinate(41.00004, 4), 410_000);
        assert_eq!(round_coordinate(41.00006, 4), 410_001);
        assert_eq!(round_coordinate(-29.12344, 4), -291_234);
    }
}
