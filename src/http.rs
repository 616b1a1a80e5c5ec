//! HTTP collaborators: an OSRM-style routing backend and a JSON poll source.
//!
//! Both share one pooled `reqwest` client configuration. Neither retries on
//! its own; the geometry sampler and the poller own retry and timeout policy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::poller::PollSource;
use crate::protocol::decode_poll_body;
use crate::sampling::RoutingBackend;
use crate::{AgentPosition, FleetError, GpsPoint, Result};

const DEFAULT_PROFILE: &str = "driving";
const DEFAULT_WAYPOINT_LIMIT: usize = 100;
const MAX_IDLE_PER_HOST: usize = 8;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .map_err(FleetError::from)
}

// ============================================================================
// Routing backend
// ============================================================================

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    geometry: RouteGeometry,
}

#[derive(Debug, Deserialize)]
struct RouteGeometry {
    /// GeoJSON order: [lng, lat]
    coordinates: Vec<[f64; 2]>,
}

/// Routing backend speaking the OSRM `route` service.
///
/// `GET {base}/route/v1/{profile}/{lng},{lat};...?overview=full&geometries=geojson`
pub struct OsrmBackend {
    client: Client,
    base_url: String,
    profile: String,
    waypoint_limit: usize,
}

impl OsrmBackend {
    /// Create a backend for the given service root, e.g.
    /// `https://router.project-osrm.org`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("[OsrmBackend] Using {}", base_url);
        Ok(Self {
            client: build_client(Duration::from_secs(30))?,
            base_url,
            profile: DEFAULT_PROFILE.to_string(),
            waypoint_limit: DEFAULT_WAYPOINT_LIMIT,
        })
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Requests with more waypoints than this are refused without a call.
    /// Keep it in line with `SamplerConfig::backend_limit`.
    pub fn with_waypoint_limit(mut self, limit: usize) -> Self {
        self.waypoint_limit = limit;
        self
    }

    fn route_url(&self, waypoints: &[GpsPoint]) -> String {
        let coords: Vec<String> = waypoints
            .iter()
            .map(|p| format!("{:.6},{:.6}", p.longitude, p.latitude))
            .collect();
        format!(
            "{}/route/v1/{}/{}?overview=full&geometries=geojson",
            self.base_url,
            self.profile,
            coords.join(";")
        )
    }
}

#[async_trait]
impl RoutingBackend for OsrmBackend {
    async fn route(&self, waypoints: &[GpsPoint]) -> Result<Vec<GpsPoint>> {
        if waypoints.len() < 2 {
            return Err(FleetError::InvalidArgument(format!(
                "route needs at least 2 waypoints, got {}",
                waypoints.len()
            )));
        }
        if waypoints.len() > self.waypoint_limit {
            return Err(FleetError::InvalidArgument(format!(
                "{} waypoints exceeds backend limit of {}",
                waypoints.len(),
                self.waypoint_limit
            )));
        }

        let url = self.route_url(waypoints);
        let start = Instant::now();
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if !status.is_success() {
            let detail = serde_json::from_slice::<RouteResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_default();
            warn!("[OsrmBackend] HTTP {} after {:?} {}", status, start.elapsed(), detail);
            return Err(FleetError::Backend(format!("HTTP {} {}", status, detail).trim_end().to_string()));
        }

        let geometry = parse_route(&body)?;
        debug!(
            "[OsrmBackend] {} waypoints -> {} points in {:?}",
            waypoints.len(),
            geometry.len(),
            start.elapsed()
        );
        Ok(geometry)
    }
}

fn parse_route(body: &[u8]) -> Result<Vec<GpsPoint>> {
    let data: RouteResponse = serde_json::from_slice(body)?;
    if data.code != "Ok" {
        return Err(FleetError::Backend(match data.message {
            Some(msg) => format!("{}: {}", data.code, msg),
            None => data.code,
        }));
    }
    Ok(data
        .routes
        .into_iter()
        .next()
        .map(|r| {
            r.geometry
                .coordinates
                .into_iter()
                .map(|[lng, lat]| GpsPoint::new(lat, lng))
                .collect()
        })
        .unwrap_or_default())
}

// ============================================================================
// Poll source
// ============================================================================

/// Poll source that GETs a JSON list of current positions.
///
/// The body may be a bare array or an object wrapping it; see
/// [`decode_poll_body`].
pub struct HttpPollSource {
    client: Client,
    url: String,
    auth_header: Option<String>,
}

impl HttpPollSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(30))?,
            url: url.into(),
            auth_header: None,
        })
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.auth_header = Some(format!("Bearer {}", token));
        self
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch_positions(&self) -> Result<Vec<AgentPosition>> {
        let mut request = self.client.get(&self.url);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::Backend(format!("HTTP {}", status)));
        }

        let text = resp.text().await?;
        decode_poll_body(&text, Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const ROUTE_OK: &str = r#"{"code":"Ok","routes":[{"geometry":{"type":"LineString",
        "coordinates":[[29.0,41.0],[29.05,41.02],[29.1,41.05]]}}]}"#;

    /// Answer exactly one request with a canned response; yields the
    /// request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).to_string());

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        (url, rx)
    }

    #[test]
    fn test_route_url() {
        let backend = OsrmBackend::new("https://router.example.com/").unwrap().with_profile("car");
        let url = backend.route_url(&[GpsPoint::new(41.0, 29.0), GpsPoint::new(41.05, 29.1)]);
        assert_eq!(
            url,
            "https://router.example.com/route/v1/car/29.000000,41.000000;29.100000,41.050000?overview=full&geometries=geojson"
        );
    }

    #[test]
    fn test_parse_route_swaps_to_lat_lng() {
        let points = parse_route(ROUTE_OK.as_bytes()).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], GpsPoint::new(41.0, 29.0));
        assert_eq!(points[2], GpsPoint::new(41.05, 29.1));
    }

    #[test]
    fn test_parse_route_errors() {
        let no_route = br#"{"code":"NoRoute","message":"Impossible route between points"}"#;
        match parse_route(no_route) {
            Err(FleetError::Backend(msg)) => assert!(msg.contains("NoRoute")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_route(b"<html>"), Err(FleetError::Decode(_))));
        assert!(parse_route(br#"{"code":"Ok","routes":[]}"#).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waypoint_limit_refused_without_call() {
        // Nothing listens on the discard port; a request would fail as Http
        let backend = OsrmBackend::new("http://127.0.0.1:9").unwrap().with_waypoint_limit(3);
        let waypoints: Vec<GpsPoint> = (0..4).map(|i| GpsPoint::new(41.0 + i as f64 * 0.01, 29.0)).collect();

        assert!(matches!(backend.route(&waypoints).await, Err(FleetError::InvalidArgument(_))));
        assert!(matches!(backend.route(&waypoints[..1]).await, Err(FleetError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_route_over_http() {
        let (url, request) = serve_once("200 OK", ROUTE_OK).await;
        let backend = OsrmBackend::new(url).unwrap();

        let points = backend
            .route(&[GpsPoint::new(41.0, 29.0), GpsPoint::new(41.05, 29.1)])
            .await
            .unwrap();
        assert_eq!(points.len(), 3);

        let head = request.await.unwrap();
        assert!(head.starts_with("GET /route/v1/driving/29.000000,41.000000;29.100000,41.050000?overview=full"));
    }

    #[tokio::test]
    async fn test_route_http_error_is_backend_error() {
        let (url, _request) =
            serve_once("400 Bad Request", r#"{"code":"InvalidQuery","message":"Query string malformed"}"#).await;
        let backend = OsrmBackend::new(url).unwrap();

        match backend.route(&[GpsPoint::new(41.0, 29.0), GpsPoint::new(41.05, 29.1)]).await {
            Err(FleetError::Backend(msg)) => assert!(msg.contains("Query string malformed"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_source_over_http() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"data":[{"driver_id":"A1","lat":41.0,"lng":29.0,"timestamp":100}]}"#,
        )
        .await;
        let source = HttpPollSource::new(format!("{}/drivers/live", url)).unwrap().with_bearer_token("t0k");

        let rows = source.fetch_positions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].agent_id, "A1");

        let head = request.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /drivers/live"));
        assert!(head.contains("authorization: bearer t0k"));
    }

    #[tokio::test]
    async fn test_poll_source_http_error() {
        let (url, _request) = serve_once("503 Service Unavailable", "").await;
        let source = HttpPollSource::new(url).unwrap();
        assert!(matches!(source.fetch_positions().await, Err(FleetError::Backend(_))));
    }
}
