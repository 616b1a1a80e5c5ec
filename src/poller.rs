//! Periodic polling of the authoritative position list.
//!
//! The poll channel is the slow, complete view of the fleet. Every tick the
//! [`PollSource`] is asked for all current positions and the rows are merged
//! into the store with the same last-write-wins rule as push events, so a
//! late poll response never rolls back a fresher push update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{AgentPosition, FleetError, LiveStateStore, PositionSource, Result};

/// Floor for the poll period; a zero interval would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where poll snapshots come from.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_positions(&self) -> Result<Vec<AgentPosition>>;
}

/// Configuration for the poll loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Time between polls. The first poll runs immediately.
    /// Default: 10 seconds
    pub interval: Duration,
    /// Time budget for one fetch.
    /// Default: 15 seconds
    pub fetch_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

/// Run the poll loop until `shutdown` flips to `true` (or its sender is
/// dropped). Failed polls are logged and skipped; the store keeps whatever it
/// already had.
pub fn spawn_poller<P>(
    store: Arc<LiveStateStore>,
    source: Arc<P>,
    config: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    P: PollSource + ?Sized + 'static,
{
    tokio::spawn(async move {
        let interval = config.interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("[Poller] Started (interval {:?})", interval);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let fetch = tokio::time::timeout(config.fetch_timeout, source.fetch_positions());
            let result = tokio::select! {
                r = fetch => r.unwrap_or(Err(FleetError::Timeout(config.fetch_timeout))),
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(mut positions) => {
                    for p in &mut positions {
                        p.source = PositionSource::Poll;
                    }
                    let total = positions.len();
                    let accepted = store.apply_poll_snapshot(positions);
                    debug!("[Poller] Merged {}/{} rows", accepted, total);
                }
                Err(e) => warn!("[Poller] Poll failed, keeping current state: {}", e),
            }
        }

        info!("[Poller] Stopped");
    })
}
