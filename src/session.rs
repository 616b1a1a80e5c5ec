//! Wiring for a live view: one store fed by both channels.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState};
use crate::poller::{spawn_poller, PollSource, PollerConfig};
use crate::LiveStateStore;

/// A running push connection and poll loop sharing one [`LiveStateStore`].
///
/// The store is created by the caller and outlives the session, so a view
/// can be torn down and restarted without losing what it already knows.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fleet_tracker::{ConnectionConfig, LiveSession, LiveStateStore, PollSource, PollerConfig};
/// # async fn run(source: Arc<dyn PollSource>) {
/// let store = Arc::new(LiveStateStore::new());
/// store.subscribe(|p| println!("{} -> {}, {}", p.agent_id, p.latitude, p.longitude));
///
/// let session = LiveSession::start(
///     Arc::clone(&store),
///     ConnectionConfig::new("wss://fleet.example.com/live"),
///     source,
///     PollerConfig::default(),
/// );
/// // ... later
/// session.shutdown().await;
/// # }
/// ```
pub struct LiveSession {
    store: Arc<LiveStateStore>,
    connection: ConnectionHandle,
    poller: JoinHandle<()>,
    stop_poller: watch::Sender<bool>,
}

impl LiveSession {
    /// Spawn the connection manager and the poller on the current runtime.
    pub fn start<P>(
        store: Arc<LiveStateStore>,
        connection_config: ConnectionConfig,
        poll_source: Arc<P>,
        poller_config: PollerConfig,
    ) -> Self
    where
        P: PollSource + ?Sized + 'static,
    {
        info!("[LiveSession] Starting (push: {})", connection_config.endpoint);

        let connection = ConnectionManager::spawn(connection_config, Arc::clone(&store));
        let (stop_poller, stop_rx) = watch::channel(false);
        let poller = spawn_poller(Arc::clone(&store), poll_source, poller_config, stop_rx);

        Self { store, connection, poller, stop_poller }
    }

    pub fn store(&self) -> &Arc<LiveStateStore> {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Stop both producers and wait for them. The store keeps its contents.
    pub async fn shutdown(self) {
        let _ = self.stop_poller.send(true);
        self.connection.shutdown().await;
        if let Err(e) = self.poller.await {
            warn!("[LiveSession] Poller ended abnormally: {}", e);
        }
        info!("[LiveSession] Stopped with {} agents in store", self.store.len());
    }
}
