//! Proximity clustering of stop events.
//!
//! Groups recorded dwells into places an agent keeps coming back to. The
//! algorithm is a greedy, seed-based single pass:
//!
//! 1. Walk the stops in input order.
//! 2. The first unassigned stop seeds a new cluster.
//! 3. Every remaining unassigned stop within `radius_meters` of the seed
//!    (Haversine) joins that cluster.
//!
//! Members are only ever compared to the seed, so a cluster can be up to
//! `2 * radius_meters` wide end to end, but no member is further than
//! `radius_meters` from the seed. The result depends on input order.
//!
//! Clusters are ranked by total dwell time, busiest first, ties kept in
//! seed order.

use std::collections::HashMap;

use log::debug;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::{FleetError, GpsPoint, Result};

/// Radius used for home/depot detection.
pub const HOME_RADIUS_METERS: f64 = 200.0;

/// Looser radius used for generic "frequent places".
pub const FREQUENT_PLACE_RADIUS_METERS: f64 = 500.0;

/// Stops whose classification is still open. Home candidates come from these.
const UNKNOWN_LOCATION_TYPE: &str = "unknown";

// Above this latitude or radius the degree envelope is unreliable and we
// fall back to a linear scan.
const INDEX_MAX_ABS_LATITUDE: f64 = 80.0;
const INDEX_MAX_RADIUS_METERS: f64 = 5_000.0;

/// A single recorded dwell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub district: Option<String>,
    pub duration_minutes: u32,
    #[serde(default = "default_location_type")]
    pub location_type: String,
}

fn default_location_type() -> String {
    UNKNOWN_LOCATION_TYPE.to_string()
}

impl StopEvent {
    /// Create a stop with an `unknown` location type and no province.
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64, duration_minutes: u32) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            province: String::new(),
            district: None,
            duration_minutes,
            location_type: default_location_type(),
        }
    }

    pub fn with_location_type(mut self, location_type: impl Into<String>) -> Self {
        self.location_type = location_type.into();
        self
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A group of stops around one seed. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopCluster {
    /// Coordinates of the seed stop
    pub representative_latitude: f64,
    pub representative_longitude: f64,
    /// Member stop ids, seed first, then in input order
    pub member_stop_ids: Vec<String>,
    /// Sum of member dwell times
    pub total_duration_minutes: u64,
    pub member_count: usize,
}

/// Configuration for stop clustering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Absorption radius around each seed, in meters.
    /// Default: 200.0 (home detection)
    pub radius_meters: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::home()
    }
}

impl ClusterConfig {
    pub fn home() -> Self {
        Self { radius_meters: HOME_RADIUS_METERS }
    }

    pub fn frequent_places() -> Self {
        Self { radius_meters: FREQUENT_PLACE_RADIUS_METERS }
    }
}

type IndexedStop = GeomWithData<[f64; 2], usize>;

/// Cluster stops by proximity to a seed stop.
///
/// Stops with invalid coordinates are skipped. Returns
/// [`FleetError::InvalidArgument`] if `radius_meters` is negative or not
/// finite.
///
/// # Example
/// ```
/// use fleet_tracker::{cluster_stops, StopEvent};
///
/// let stops = vec![
///     StopEvent::new("S1", 41.00000, 29.00000, 10),
///     StopEvent::new("S2", 41.00010, 29.00010, 5),
///     StopEvent::new("S3", 39.0, 35.0, 20),
/// ];
///
/// let clusters = cluster_stops(&stops, 200.0).unwrap();
/// assert_eq!(clusters.len(), 2);
/// assert_eq!(clusters[0].member_stop_ids, vec!["S3"]);
/// assert_eq!(clusters[1].total_duration_minutes, 15);
/// ```
pub fn cluster_stops(stops: &[StopEvent], radius_meters: f64) -> Result<Vec<StopCluster>> {
    if !radius_meters.is_finite() || radius_meters < 0.0 {
        return Err(FleetError::InvalidArgument(format!(
            "radius_meters must be a non-negative finite number, got {}",
            radius_meters
        )));
    }
    Ok(greedy_cluster(stops, radius_meters))
}

/// Home/depot candidates: `unknown` stops clustered at 200 m.
pub fn detect_home_candidates(stops: &[StopEvent]) -> Vec<StopCluster> {
    let unknown: Vec<StopEvent> = stops
        .iter()
        .filter(|s| s.location_type.eq_ignore_ascii_case(UNKNOWN_LOCATION_TYPE))
        .cloned()
        .collect();
    greedy_cluster(&unknown, HOME_RADIUS_METERS)
}

/// Frequently visited places: all stops clustered at 500 m.
pub fn frequent_places(stops: &[StopEvent]) -> Vec<StopCluster> {
    greedy_cluster(stops, FREQUENT_PLACE_RADIUS_METERS)
}

/// Cluster each agent's stop history independently.
pub fn cluster_stops_by_agent(
    stops_by_agent: &HashMap<String, Vec<StopEvent>>,
    config: &ClusterConfig,
) -> Result<HashMap<String, Vec<StopCluster>>> {
    stops_by_agent
        .iter()
        .map(|(agent_id, stops)| {
            cluster_stops(stops, config.radius_meters).map(|c| (agent_id.clone(), c))
        })
        .collect()
}

/// Same as [`cluster_stops_by_agent`], one rayon task per agent.
#[cfg(feature = "parallel")]
pub fn cluster_stops_by_agent_parallel(
    stops_by_agent: &HashMap<String, Vec<StopEvent>>,
    config: &ClusterConfig,
) -> Result<HashMap<String, Vec<StopCluster>>> {
    use rayon::prelude::*;

    stops_by_agent
        .par_iter()
        .map(|(agent_id, stops)| {
            cluster_stops(stops, config.radius_meters).map(|c| (agent_id.clone(), c))
        })
        .collect()
}

fn greedy_cluster(stops: &[StopEvent], radius_meters: f64) -> Vec<StopCluster> {
    let valid: Vec<&StopEvent> = stops
        .iter()
        .filter(|s| s.point().is_valid())
        .collect();

    if valid.len() < stops.len() {
        debug!(
            "[Clusterer] Skipped {} stops with invalid coordinates",
            stops.len() - valid.len()
        );
    }
    if valid.is_empty() {
        return vec![];
    }

    let use_index = radius_meters <= INDEX_MAX_RADIUS_METERS && valid.len() > 16;
    let rtree: Option<RTree<IndexedStop>> = use_index.then(|| {
        RTree::bulk_load(
            valid
                .iter()
                .enumerate()
                .map(|(i, s)| IndexedStop::new([s.longitude, s.latitude], i))
                .collect(),
        )
    });

    let mut assigned = vec![false; valid.len()];
    let mut clusters = Vec::new();

    for seed_idx in 0..valid.len() {
        if assigned[seed_idx] {
            continue;
        }
        assigned[seed_idx] = true;
        let seed = valid[seed_idx];
        let seed_point = seed.point();

        let candidates = match rtree.as_ref().and_then(|t| envelope_candidates(t, &seed_point, radius_meters)) {
            Some(c) => c,
            None => (seed_idx + 1..valid.len()).collect(),
        };

        let mut members = vec![seed_idx];
        for idx in candidates {
            if assigned[idx] {
                continue;
            }
            if haversine_distance(&seed_point, &valid[idx].point()) <= radius_meters {
                assigned[idx] = true;
                members.push(idx);
            }
        }

        clusters.push(StopCluster {
            representative_latitude: seed.latitude,
            representative_longitude: seed.longitude,
            member_stop_ids: members.iter().map(|&i| valid[i].id.clone()).collect(),
            total_duration_minutes: members.iter().map(|&i| valid[i].duration_minutes as u64).sum(),
            member_count: members.len(),
        });
    }

    // Stable: equal durations keep seed order
    clusters.sort_by(|a, b| b.total_duration_minutes.cmp(&a.total_duration_minutes));

    debug!(
        "[Clusterer] {} stops -> {} clusters (radius {}m)",
        valid.len(),
        clusters.len(),
        radius_meters
    );

    clusters
}

/// Indices inside a padded degree envelope around the seed, in input order.
///
/// Returns `None` where the envelope can't be trusted (near the poles or
/// across the antimeridian) so the caller scans linearly instead.
fn envelope_candidates(
    rtree: &RTree<IndexedStop>,
    seed: &GpsPoint,
    radius_meters: f64,
) -> Option<Vec<usize>> {
    let lat_pad = radius_meters / 110_000.0;
    let lng_pad = meters_to_degrees(radius_meters, seed.latitude) * 1.05;

    if seed.latitude.abs() + lat_pad > INDEX_MAX_ABS_LATITUDE
        || seed.longitude - lng_pad < -180.0
        || seed.longitude + lng_pad > 180.0
    {
        return None;
    }

    let envelope = AABB::from_corners(
        [seed.longitude - lng_pad, seed.latitude - lat_pad],
        [seed.longitude + lng_pad, seed.latitude + lat_pad],
    );
    let mut found: Vec<usize> = rtree
        .locate_in_envelope(&envelope)
        .map(|s| s.data)
        .collect();
    found.sort_unstable();
    Some(found)
}

// ============================================================================
// Tests
// ============================================================================
