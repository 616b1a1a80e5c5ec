//! Waypoint sampling and cached route geometry.
//!
//! A raw trace can hold thousands of fixes while a routing backend accepts
//! around a hundred. [`sample_waypoints`] reduces a trace to a bounded,
//! endpoint-preserving subset, and [`RouteGeometrySampler`] sends that subset
//! to a [`RoutingBackend`], caches the polyline and falls back to
//! straight segments between the raw fixes whenever the backend can't help.
//!
//! ## Cache key
//!
//! Results are keyed on the sampled endpoints (rounded to 4 decimals, ~11 m)
//! plus the sampled point count. Interior points are ignored, so a trace
//! that keeps growing at the same density and stays between the same
//! endpoints reuses its geometry. This trades a little staleness for a much
//! higher hit rate on traces that are viewed repeatedly.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use moka::future::Cache;
use serde::Deserialize;
use tokio::sync::watch;

use crate::geo_utils::round_coordinate;
use crate::{FleetError, GpsPoint, Result};

/// Decimal places kept for cache key coordinates.
const KEY_DECIMALS: u32 = 4;

/// The routing collaborator. Accepts an ordered, bounded list of waypoints
/// and returns a road-following polyline.
#[async_trait]
pub trait RoutingBackend: Send + Sync {
    async fn route(&self, waypoints: &[GpsPoint]) -> Result<Vec<GpsPoint>>;
}

/// Configuration for waypoint sampling and the geometry cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Target waypoint count sent to the backend.
    /// Default: 50
    pub max_points: usize,
    /// Hard waypoint limit of the backend.
    /// Default: 100
    pub backend_limit: usize,
    /// A cached polyline younger than this is served without a backend call.
    /// Default: 5 minutes
    pub fresh_for: Duration,
    /// Entries unused for this long are evicted.
    /// Default: 10 minutes
    pub evict_after_idle: Duration,
    /// Time budget for a single backend call.
    /// Default: 10 seconds
    pub backend_timeout: Duration,
    /// Retries after a failed backend call.
    /// Default: 1
    pub max_retries: u32,
    /// Pause before retrying.
    /// Default: 500 ms
    pub retry_delay: Duration,
    /// Maximum number of cached polylines.
    /// Default: 256
    pub cache_capacity: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_points: 50,
            backend_limit: 100,
            fresh_for: Duration::from_secs(5 * 60),
            evict_after_idle: Duration::from_secs(10 * 60),
            backend_timeout: Duration::from_secs(10),
            max_retries: 1,
            retry_delay: Duration::from_millis(500),
            cache_capacity: 256,
        }
    }
}

impl SamplerConfig {
    /// Sampling target, capped so that the sampler's "+1" overshoot still
    /// fits within the backend limit.
    fn effective_max_points(&self) -> usize {
        self.max_points
            .min(self.backend_limit.saturating_sub(1))
            .max(2)
    }
}

/// Where a [`GeometryResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometrySource {
    /// Fresh polyline from the routing backend
    Backend,
    /// Polyline served from the cache
    Cache,
    /// Straight segments between the valid raw points
    StraightLine,
}

/// Drawable geometry for a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryResult {
    pub geometry: Vec<GpsPoint>,
    /// True while a backend request is still outstanding
    pub loading: bool,
    /// True if the backend failed and `geometry` is a fallback
    pub is_error: bool,
    pub source: GeometrySource,
}

impl GeometryResult {
    fn straight_line(points: Vec<GpsPoint>, is_error: bool) -> Self {
        Self {
            geometry: points,
            loading: false,
            is_error,
            source: GeometrySource::StraightLine,
        }
    }
}

/// Cache key for a sampled trace: rounded endpoints plus sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryKey {
    first: (i64, i64),
    last: (i64, i64),
    count: usize,
}

impl GeometryKey {
    /// Build a key from an already sampled trace. `None` for an empty trace.
    pub fn from_sampled(sampled: &[GpsPoint]) -> Option<Self> {
        let first = sampled.first()?;
        let last = sampled.last()?;
        Some(Self {
            first: (
                round_coordinate(first.latitude, KEY_DECIMALS),
                round_coordinate(first.longitude, KEY_DECIMALS),
            ),
            last: (
                round_coordinate(last.latitude, KEY_DECIMALS),
                round_coordinate(last.longitude, KEY_DECIMALS),
            ),
            count: sampled.len(),
        })
    }
}

impl fmt::Display for GeometryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scale = 10f64.powi(KEY_DECIMALS as i32);
        write!(
            f,
            "{:.4},{:.4}->{:.4},{:.4}#{}",
            self.first.0 as f64 / scale,
            self.first.1 as f64 / scale,
            self.last.0 as f64 / scale,
            self.last.1 as f64 / scale,
            self.count
        )
    }
}

/// Reduce a trace to at most `max_points + 1` waypoints.
///
/// Invalid points are dropped first. If what remains fits in `max_points`
/// it is returned unchanged. Otherwise, with `step = ceil(count / max_points)`,
/// the output is the first point, every `step`-th point from index `step` up
/// to (not including) the last index, and the last point. The last point
/// is always kept, which can overshoot `max_points` by one.
///
/// `max_points` below 2 is treated as 2.
///
/// # Example
/// ```
/// use fleet_tracker::{sample_waypoints, GpsPoint};
///
/// let trace: Vec<GpsPoint> = (0..120)
///     .map(|i| GpsPoint::new(41.0 + i as f64 * 0.0001, 29.0))
///     .collect();
///
/// let sampled = sample_waypoints(&trace, 50);
/// assert!(sampled.len() <= 51);
/// assert_eq!(sampled[0], trace[0]);
/// assert_eq!(sampled[sampled.len() - 1], trace[119]);
/// ```
pub fn sample_waypoints(points: &[GpsPoint], max_points: usize) -> Vec<GpsPoint> {
    let valid: Vec<GpsPoint> = points.iter().copied().filter(|p| p.is_valid()).collect();
    downsample(valid, max_points)
}

fn downsample(valid: Vec<GpsPoint>, max_points: usize) -> Vec<GpsPoint> {
    let max_points = max_points.max(2);
    if valid.len() <= max_points {
        return valid;
    }

    let step = valid.len().div_ceil(max_points);
    let last = valid.len() - 1;

    let mut sampled = Vec::with_capacity(max_points + 1);
    sampled.push(valid[0]);
    sampled.extend(valid[..last].iter().skip(step).step_by(step).copied());
    sampled.push(valid[last]);
    sampled
}

#[derive(Clone)]
struct CachedGeometry {
    points: Arc<Vec<GpsPoint>>,
    fetched_at: Instant,
}

/// Turns raw traces into drawable geometry via a routing backend, with
/// caching and a straight-line fallback.
pub struct RouteGeometrySampler<B: RoutingBackend + ?Sized> {
    backend: Arc<B>,
    cache: Cache<GeometryKey, CachedGeometry>,
    config: SamplerConfig,
}

impl<B: RoutingBackend + ?Sized> RouteGeometrySampler<B> {
    pub fn new(backend: Arc<B>, config: SamplerConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_idle(config.evict_after_idle)
            .build();
        Self { backend, cache, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Resolve drawable geometry for a trace. Never returns an empty path
    /// when the trace holds at least two valid points.
    pub async fn geometry(&self, locations: &[GpsPoint]) -> GeometryResult {
        let valid: Vec<GpsPoint> = locations.iter().copied().filter(|p| p.is_valid()).collect();
        let sampled = downsample(valid.clone(), self.config.effective_max_points());

        let key = match GeometryKey::from_sampled(&sampled) {
            Some(key) if sampled.len() >= 2 => key,
            _ => {
                debug!("[GeometrySampler] {} valid points, skipping backend", valid.len());
                return GeometryResult::straight_line(valid, false);
            }
        };

        let cached = self.cache.get(&key).await;
        if let Some(entry) = &cached {
            if entry.fetched_at.elapsed() < self.config.fresh_for {
                debug!("[GeometrySampler] Cache hit {}", key);
                return GeometryResult {
                    geometry: entry.points.as_ref().clone(),
                    loading: false,
                    is_error: false,
                    source: GeometrySource::Cache,
                };
            }
        }

        match self.fetch_with_retry(&sampled).await {
            Ok(polyline) => {
                info!(
                    "[GeometrySampler] {} -> {} waypoints -> {} polyline points",
                    key,
                    sampled.len(),
                    polyline.len()
                );
                let points = Arc::new(polyline);
                self.cache
                    .insert(key, CachedGeometry { points: Arc::clone(&points), fetched_at: Instant::now() })
                    .await;
                GeometryResult {
                    geometry: points.as_ref().clone(),
                    loading: false,
                    is_error: false,
                    source: GeometrySource::Backend,
                }
            }
            Err(e) => {
                warn!("[GeometrySampler] Routing failed for {}: {}", key, e);
                match cached {
                    Some(entry) => GeometryResult {
                        geometry: entry.points.as_ref().clone(),
                        loading: false,
                        is_error: true,
                        source: GeometrySource::Cache,
                    },
                    None => GeometryResult::straight_line(valid, true),
                }
            }
        }
    }

    async fn fetch_with_retry(&self, waypoints: &[GpsPoint]) -> Result<Vec<GpsPoint>> {
        let attempts = self.config.max_retries + 1;
        let mut last_error = FleetError::Backend("no attempt made".to_string());

        for attempt in 1..=attempts {
            let call = tokio::time::timeout(self.config.backend_timeout, self.backend.route(waypoints));
            let outcome = match call.await {
                Ok(Ok(polyline)) if polyline.len() >= 2 => return Ok(polyline),
                Ok(Ok(_)) => FleetError::Backend("empty geometry".to_string()),
                Ok(Err(e)) => e,
                Err(_) => FleetError::Timeout(self.config.backend_timeout),
            };

            debug!("[GeometrySampler] Attempt {}/{} failed: {}", attempt, attempts, outcome);
            last_error = outcome;

            if attempt < attempts && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error)
    }
}

impl<B: RoutingBackend + ?Sized + 'static> RouteGeometrySampler<B> {
    /// Start resolving geometry in the background.
    ///
    /// The receiver immediately holds the straight-line geometry with
    /// `loading = true`, and is updated once the backend (or cache) answers.
    /// Must be called from within a tokio runtime.
    pub fn watch_geometry(self: &Arc<Self>, locations: Vec<GpsPoint>) -> watch::Receiver<GeometryResult> {
        let valid: Vec<GpsPoint> = locations.iter().copied().filter(|p| p.is_valid()).collect();
        let (tx, rx) = watch::channel(GeometryResult {
            geometry: valid,
            loading: true,
            is_error: false,
            source: GeometrySource::StraightLine,
        });

        let sampler = Arc::clone(self);
        tokio::spawn(async move {
            let result = sampler.geometry(&locations).await;
            // Receiver may be gone; nothing left to update then.
            let _ = tx.send(result);
        });

        rx
    }
}

// ============================================================================
// Tests
// ============================================================================
