//! Example of a live fleet view fed by polling and a push socket.
//!
//! Run with:
//!   cargo run --example live_monitor -- <poll-url> <ws-url> [osrm-url]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_tracker::{
    AgentStatus, ConnectionConfig, HttpPollSource, LiveSession, LiveStateStore, OsrmBackend,
    PollerConfig, PositionFilter, RouteGeometrySampler, SamplerConfig,
};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: live_monitor <poll-url> <ws-url> [osrm-url]");
        return;
    }

    let source = match HttpPollSource::new(args[1].clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to create poll source: {}", e);
            return;
        }
    };

    let store = Arc::new(LiveStateStore::new());
    store.subscribe(|p| {
        println!(
            "  [{:?}] {} at ({:.5}, {:.5}) {:.0} km/h {:?}",
            p.source, p.agent_id, p.latitude, p.longitude, p.speed, p.status
        );
    });

    let session = LiveSession::start(
        Arc::clone(&store),
        ConnectionConfig::new(args[2].clone()),
        source,
        PollerConfig::default(),
    );

    println!("Watching for 60 seconds...\n");
    tokio::time::sleep(Duration::from_secs(60)).await;

    let now = Utc::now().timestamp_millis();
    let on_trip = store.snapshot_filtered(&PositionFilter::default().with_statuses([AgentStatus::OnTrip]));
    let stale = store.stale_agents(now, Duration::from_secs(5 * 60));
    println!("\nAgents: {}, on trip: {}, stale: {}", store.len(), on_trip.len(), stale.len());
    println!("Stats: {:?}", store.stats());

    // Route the last positions of on-trip agents, straight line if no router
    if let Some(osrm_url) = args.get(3) {
        match OsrmBackend::new(osrm_url.clone()) {
            Ok(backend) => {
                let sampler = RouteGeometrySampler::new(Arc::new(backend), SamplerConfig::default());
                let points: Vec<_> = on_trip.iter().map(|p| p.point()).collect();
                let result = sampler.geometry(&points).await;
                println!(
                    "Geometry through {} agents: {} points via {:?} (error: {})",
                    points.len(),
                    result.geometry.len(),
                    result.source,
                    result.is_error
                );
            }
            Err(e) => eprintln!("Failed to create routing backend: {}", e),
        }
    }

    session.shutdown().await;
}
