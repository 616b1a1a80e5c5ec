//! # Fleet Tracker
//!
//! Live position reconciliation and spatial analysis for a fleet of mobile
//! agents (vehicles/drivers).
//!
//! This library provides:
//! - A [`LiveStateStore`] that merges a periodic poll snapshot and a push
//!   stream into one per-agent state using last-write-wins by event time
//! - A [`ConnectionManager`] that keeps the push socket alive (heartbeat,
//!   reconnect with backoff) and decodes wire messages into [`PushEvent`]s
//! - Greedy proximity clustering of stop events to surface frequently
//!   visited places ([`cluster_stops`])
//! - Waypoint sampling and cached route geometry with a straight-line
//!   fallback ([`RouteGeometrySampler`])
//!
//! ## Features
//!
//! - **`parallel`** - Per-agent batch clustering with rayon
//! - **`http`** - HTTP routing backend and HTTP poll source (default)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use fleet_tracker::{AgentPosition, AgentStatus, LiveStateStore, PositionSource};
//!
//! let store = LiveStateStore::new();
//! let fresh = AgentPosition::new("A1", 41.0, 29.0, 100).with_source(PositionSource::Poll);
//! let late = AgentPosition::new("A1", 41.5, 29.5, 90).with_source(PositionSource::Push);
//!
//! store.apply_poll_snapshot(vec![fresh]);
//! store.apply_position(late); // older observed_at, rejected
//!
//! let current = store.get("A1").unwrap();
//! assert_eq!(current.observed_at, 100);
//! assert_eq!(current.status, AgentStatus::Active);
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{FleetError, Result};

pub mod geo_utils;

// Stop clustering (frequent places / home detection)
pub mod clustering;
pub use clustering::{
    cluster_stops, cluster_stops_by_agent, detect_home_candidates, frequent_places,
    ClusterConfig, StopCluster, StopEvent, FREQUENT_PLACE_RADIUS_METERS, HOME_RADIUS_METERS,
};
#[cfg(feature = "parallel")]
pub use clustering::cluster_stops_by_agent_parallel;

// Waypoint sampling and route geometry
pub mod sampling;
pub use sampling::{
    sample_waypoints, GeometryKey, GeometryResult, GeometrySource, RouteGeometrySampler,
    RoutingBackend, SamplerConfig,
};

// Push channel wire format
pub mod protocol;
pub use protocol::{decode_message, decode_poll_body, PushEvent};

// Reconciliation core
pub mod store;
pub use store::{
    ApplyOutcome, EventSink, LiveStateStore, PositionFilter, StoreStats, SubscriptionId,
};

// Push channel lifecycle
pub mod connection;
pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState, ReconnectPolicy,
};

// Periodic poll collaborator
pub mod poller;
pub use poller::{spawn_poller, PollSource, PollerConfig};

pub mod session;
pub use session::LiveSession;

// HTTP routing backend and poll source
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpPollSource, OsrmBackend};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use fleet_tracker::GpsPoint;
/// let point = GpsPoint::new(41.0082, 28.9784); // Istanbul
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        geo_utils::is_valid_coordinate(self.latitude, self.longitude)
    }
}

/// Bounding box, e.g. a map viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        geo_utils::compute_bounds(points)
    }

    /// Whether a coordinate lies inside (edges included).
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lng
            && longitude <= self.max_lng
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// Operational status reported for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    OnTrip,
    AtHome,
    #[default]
    Active,
    Inactive,
}

/// Which channel delivered a position. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    #[default]
    Poll,
    Push,
}

/// One agent's most recent known state.
///
/// `observed_at` is the event time in epoch milliseconds and is the only
/// ordering signal the store uses. `speed` is km/h and is normalised to a
/// non-negative finite value on ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub agent_id: String,
    #[serde(default)]
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub region_hint: Option<String>,
    pub observed_at: i64,
    #[serde(default)]
    pub source: PositionSource,
}

impl AgentPosition {
    /// Create a position with default name, speed, status and source.
    pub fn new(agent_id: impl Into<String>, latitude: f64, longitude: f64, observed_at: i64) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: String::new(),
            latitude,
            longitude,
            speed: 0.0,
            status: AgentStatus::default(),
            region_hint: None,
            observed_at,
            source: PositionSource::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region_hint = Some(region.into());
        self
    }

    pub fn with_source(mut self, source: PositionSource) -> Self {
        self.source = source;
        self
    }

    /// The position as a [`GpsPoint`].
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check if the position carries valid coordinates.
    pub fn has_valid_coordinates(&self) -> bool {
        geo_utils::is_valid_coordinate(self.latitude, self.longitude)
    }
}

// ============================================================================
// Tests
// ============================================================================
