//! Example of clustering many drivers' stop histories at once.
//!
//! Run with: cargo run --example batch_clustering --features parallel

use fleet_tracker::{
    cluster_stops_by_agent, cluster_stops_by_agent_parallel, ClusterConfig, StopEvent,
};
use std::collections::HashMap;
use std::time::Instant;

/// Deterministic pseudo-random offsets so runs are comparable.
fn jitter(seed: &mut u64) -> f64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    ((*seed >> 33) as f64 / (1u64 << 31) as f64) - 0.5
}

fn main() {
    println!("Batch Stop Clustering Example\n");

    // A few home areas per city, each driver assigned to one
    let cities = [
        ("istanbul", 41.0082, 28.9784),
        ("ankara", 39.9334, 32.8597),
        ("izmir", 38.4237, 27.1428),
    ];

    let mut seed = 42u64;
    let mut stops_by_agent: HashMap<String, Vec<StopEvent>> = HashMap::new();

    for driver in 0..300 {
        let (city, lat, lng) = cities[driver % cities.len()];
        let home = (lat + jitter(&mut seed) * 0.2, lng + jitter(&mut seed) * 0.2);
        let agent_id = format!("{}-{:03}", city, driver);

        let stops = (0..200)
            .map(|i| {
                // Two thirds of stops near home, the rest across the city
                let (base_lat, base_lng, spread) = if i % 3 == 0 {
                    (lat, lng, 0.3)
                } else {
                    (home.0, home.1, 0.002)
                };
                StopEvent::new(
                    format!("{}-s{}", agent_id, i),
                    base_lat + jitter(&mut seed) * spread,
                    base_lng + jitter(&mut seed) * spread,
                    (10.0 + (jitter(&mut seed) + 0.5) * 500.0) as u32,
                )
            })
            .collect();
        stops_by_agent.insert(agent_id, stops);
    }

    let total_stops: usize = stops_by_agent.values().map(Vec::len).sum();
    println!("Drivers: {}, stops: {}\n", stops_by_agent.len(), total_stops);

    let config = ClusterConfig::home();

    let start = Instant::now();
    let sequential = cluster_stops_by_agent(&stops_by_agent, &config).unwrap();
    let seq_time = start.elapsed();

    let start = Instant::now();
    let parallel = cluster_stops_by_agent_parallel(&stops_by_agent, &config).unwrap();
    let par_time = start.elapsed();

    println!("Sequential: {:?}", seq_time);
    println!("Parallel:   {:?}", par_time);
    println!("Same result: {}\n", sequential == parallel);

    let mut agents: Vec<&String> = parallel.keys().collect();
    agents.sort();
    println!("Top cluster for the first 5 drivers:");
    for agent in agents.iter().take(5) {
        let clusters = &parallel[*agent];
        if let Some(top) = clusters.first() {
            println!(
                "  {}: {} clusters, top ({:.4}, {:.4}) with {} stops / {} min",
                agent,
                clusters.len(),
                top.representative_latitude,
                top.representative_longitude,
                top.member_count,
                top.total_duration_minutes
            );
        }
    }
}
