//! Example of finding home/depot candidates and frequent places for one
//! driver's stop history.
//!
//! Run with: cargo run --example home_detection

use fleet_tracker::{cluster_stops, detect_home_candidates, frequent_places, StopEvent};

fn main() {
    // One week of stops around Istanbul
    let stops = vec![
        StopEvent::new("mon-night", 41.04210, 29.00950, 540),
        StopEvent::new("tue-night", 41.04190, 29.00990, 510),
        StopEvent::new("wed-night", 41.04230, 29.00920, 600),
        StopEvent::new("depot-am", 41.00820, 28.97840, 25).with_location_type("loading"),
        StopEvent::new("depot-pm", 41.00850, 28.97900, 30).with_location_type("loading"),
        StopEvent::new("cafe", 41.03600, 28.98500, 15),
        StopEvent::new("cafe-2", 41.03690, 28.98610, 20),
        StopEvent::new("fuel", 40.99000, 29.10000, 10),
    ];

    println!("Home Detection Example\n");
    println!("{} stops\n", stops.len());

    println!("1. Home candidates (unknown stops, 200m):");
    for (i, c) in detect_home_candidates(&stops).iter().enumerate() {
        println!(
            "   #{} ({:.5}, {:.5}) {} stops, {} min: {:?}",
            i + 1,
            c.representative_latitude,
            c.representative_longitude,
            c.member_count,
            c.total_duration_minutes,
            c.member_stop_ids
        );
    }

    println!("\n2. Frequent places (all stops, 500m):");
    for (i, c) in frequent_places(&stops).iter().enumerate() {
        println!(
            "   #{} ({:.5}, {:.5}) {} stops, {} min",
            i + 1,
            c.representative_latitude,
            c.representative_longitude,
            c.member_count,
            c.total_duration_minutes
        );
    }

    println!("\n3. Custom radius (50m):");
    match cluster_stops(&stops, 50.0) {
        Ok(clusters) => println!("   {} clusters", clusters.len()),
        Err(e) => println!("   Error: {}", e),
    }

    println!("\n4. Invalid radius (-1m):");
    match cluster_stops(&stops, -1.0) {
        Ok(clusters) => println!("   {} clusters", clusters.len()),
        Err(e) => println!("   Error: {}", e),
    }
}
