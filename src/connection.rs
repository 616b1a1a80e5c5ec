//! Push channel lifecycle.
//!
//! [`ConnectionManager`] owns one long-lived websocket and turns its text
//! frames into [`PushEvent`]s for an [`EventSink`] (normally the
//! [`LiveStateStore`](crate::LiveStateStore)).
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> (wait) -> Connecting ...
//! ```
//!
//! - While connected a `{"type":"ping"}` frame goes out every heartbeat
//!   interval. No reply is required.
//! - Any transport error or remote close drops back to `Disconnected` and a
//!   reconnect is scheduled per the [`ReconnectPolicy`]. Retries never stop.
//! - Frames that fail to decode are counted and dropped. They never affect
//!   the connection.
//! - Events from one connection are delivered one at a time, in wire order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{decode_message, ping_message};
use crate::store::EventSink;
use crate::FleetError;

/// Floor for the heartbeat period; a zero interval would spin.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay before the next connection attempt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped, optionally with equal jitter
    /// (half fixed, half random).
    Exponential {
        base: Duration,
        cap: Duration,
        jitter: bool,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(5))
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1 = first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { base, cap, jitter } => {
                let shift = attempt.saturating_sub(1).min(16);
                let capped = base.saturating_mul(1u32 << shift).min(cap);
                if !jitter {
                    return capped;
                }
                let half = capped / 2;
                let spread = rand::rng().random_range(0..=half.as_millis() as u64);
                half + Duration::from_millis(spread)
            }
        }
    }
}

/// Configuration for the push connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Websocket URL (`ws://` or `wss://`)
    pub endpoint: String,
    /// Keepalive interval.
    /// Default: 30 seconds
    pub heartbeat_interval: Duration,
    /// Default: fixed 5 seconds
    pub reconnect: ReconnectPolicy,
    /// Drop the connection if nothing at all arrives for this long.
    /// Default: None (rely on the transport to detect dead peers)
    pub liveness_timeout: Option<Duration>,
    /// Time budget for the TCP + websocket handshake.
    /// Default: 10 seconds
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/live".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            liveness_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }
}

/// Point-in-time copy of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    /// Connection attempts, successful or not
    pub attempts: u64,
    /// Successful handshakes
    pub connects: u64,
    /// Events handed to the sink
    pub events_delivered: u64,
    /// Frames dropped as undecodable or invalid
    pub messages_dropped: u64,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    connects: AtomicU64,
    events_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionCounters {
        ConnectionCounters {
            attempts: self.attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed(FleetError),
}

/// Control handle for a running [`ConnectionManager`].
///
/// Dropping the handle stops the manager as well.
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn counters(&self) -> ConnectionCounters {
        self.counters.snapshot()
    }

    /// Close the socket, stop reconnecting, and wait for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("[ConnectionManager] Task ended abnormally: {}", e);
        }
    }
}

/// Owns the push socket and feeds decoded events into a sink.
pub struct ConnectionManager<S: EventSink> {
    config: ConnectionConfig,
    sink: S,
    state: watch::Sender<ConnectionState>,
    counters: Arc<Counters>,
}

impl<S: EventSink + 'static> ConnectionManager<S> {
    /// Start the connection loop on the current tokio runtime.
    pub fn spawn(config: ConnectionConfig, sink: S) -> ConnectionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let manager = ConnectionManager {
            config,
            sink,
            state: state_tx,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(manager.run(shutdown_rx));

        ConnectionHandle { state: state_rx, shutdown: shutdown_tx, counters, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let endpoint = self.config.endpoint.clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            debug!("[ConnectionManager] Connecting to {}", endpoint);

            let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(endpoint.as_str()));
            let result = tokio::select! {
                r = connect => r,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(Ok((socket, _response))) => {
                    attempt = 0;
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    info!("[ConnectionManager] Connected to {}", endpoint);

                    match self.serve(socket, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) => {
                            info!("[ConnectionManager] Disconnected from {}: {}", endpoint, reason)
                        }
                    }
                }
                Ok(Err(e)) => warn!("[ConnectionManager] Connect to {} failed: {}", endpoint, FleetError::from(e)),
                Err(_) => warn!(
                    "[ConnectionManager] Connect to {} timed out after {:?}",
                    endpoint, self.config.connect_timeout
                ),
            }

            self.set_state(ConnectionState::Disconnected);
            attempt = attempt.saturating_add(1);
            let delay = self.config.reconnect.delay(attempt);
            info!("[ConnectionManager] Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("[ConnectionManager] Stopped");
    }

    async fn serve(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        if self.config.heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                "[ConnectionManager] Heartbeat interval {:?} too small, using {:?}",
                self.config.heartbeat_interval, MIN_HEARTBEAT_INTERVAL
            );
        }
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; no ping right after the handshake.
        heartbeat.tick().await;

        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Text(ping_message())).await {
                        return SessionEnd::Closed(e.into());
                    }
                    debug!("[ConnectionManager] Heartbeat sent");
                }
                _ = liveness_deadline(last_inbound, self.config.liveness_timeout) => {
                    let waited = self.config.liveness_timeout.unwrap_or_default();
                    return SessionEnd::Closed(FleetError::Timeout(waited));
                }
                frame = read.next() => {
                    let message = match frame {
                        None => return SessionEnd::Closed(FleetError::Transport("stream ended".to_string())),
                        Some(Err(e)) => return SessionEnd::Closed(e.into()),
                        Some(Ok(message)) => message,
                    };
                    last_inbound = Instant::now();

                    match message {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.handle_text(text),
                            Err(_) => {
                                self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        Message::Close(frame) => {
                            return SessionEnd::Closed(FleetError::Transport(format!("remote close {:?}", frame)));
                        }
                        // Control frames are answered by tungstenite.
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_message(text) {
            Some(event) => {
                self.sink.deliver(event);
                self.counters.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

async fn liveness_deadline(last_inbound: Instant, timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep_until(last_inbound + timeout).await,
        None => futures::future::pending::<()>().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PushEvent;
    use crate::{AgentStatus, LiveStateStore};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    const LOCATION_A1: &str =
        r#"{"type":"location_update","driver_id":"A1","lat":41.0,"lng":29.0,"timestamp":100}"#;
    const LOCATION_A2: &str =
        r#"{"type":"location_update","driver_id":"A2","lat":40.0,"lng":30.0,"timestamp":200}"#;

    fn test_config(endpoint: String) -> ConnectionConfig {
        ConnectionConfig {
            endpoint,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(50)),
            liveness_timeout: None,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(50), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_policy() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));

        let jittered = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: true,
        };
        for attempt in 1..12 {
            let d = jittered.delay(attempt);
            let full = policy.delay(attempt);
            assert!(d >= full / 2 && d <= full, "attempt {}: {:?}", attempt, d);
        }
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_break_connection() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(LOCATION_A1.to_string())).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"location_update","driver_id":"A1","latitude":200,"longitude":29.0,"timestamp":300}"#
                    .to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text("{{{ not json".to_string())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"driver_status","driver_id":"A1","status":"on_trip"}"#.to_string()))
                .await
                .unwrap();
            // Hold the connection open
            while ws.next().await.is_some() {}
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionManager::spawn(test_config(url), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.agent_id(), "A1");
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, PushEvent::StatusChange { status: AgentStatus::OnTrip, .. }));

        wait_for(|| handle.counters().messages_dropped == 2).await;
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.counters().connects, 1);
        assert_eq!(handle.counters().events_delivered, 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let (listener, url) = bind().await;
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = ping_tx.send(text);
                }
            }
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..test_config(url)
        };
        let handle = ConnectionManager::spawn(config, tx);

        let ping = tokio::time::timeout(Duration::from_secs(2), ping_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&ping).unwrap();
        assert_eq!(value["type"], "ping");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_heartbeat_interval_is_clamped() {
        let (listener, url) = bind().await;
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = ping_tx.send(text);
                }
            }
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            ..test_config(url)
        };
        let handle = ConnectionManager::spawn(config, tx);

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), ping_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close_and_keeps_store() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            // First session: one update, then close
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(LOCATION_A1.to_string())).await.unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            // Second session: another update, then hold open
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(LOCATION_A2.to_string())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let store = Arc::new(LiveStateStore::new());
        let handle = ConnectionManager::spawn(test_config(url), Arc::clone(&store));

        wait_for(|| store.len() == 2).await;

        assert_eq!(handle.counters().connects, 2);
        assert!(store.get("A1").is_some(), "data from the first session survives");
        assert_eq!(store.get("A2").unwrap().observed_at, 200);
        wait_for(|| handle.state() == ConnectionState::Connected).await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_when_endpoint_unavailable() {
        // Reserve a port, then close it so connects are refused
        let (listener, url) = bind().await;
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConnectionManager::spawn(test_config(url), tx);

        wait_for(|| handle.counters().attempts >= 3).await;
        assert_eq!(handle.counters().connects, 0);
        assert_ne!(handle.state(), ConnectionState::Connected);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness_timeout_forces_reconnect() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    // Accept and then stay silent
                    let mut ws = accept_async(stream).await.unwrap();
                    while ws.next().await.is_some() {}
                });
            }
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            liveness_timeout: Some(Duration::from_millis(100)),
            ..test_config(url)
        };
        let handle = ConnectionManager::spawn(config, tx);

        wait_for(|| handle.counters().connects >= 2).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_manager() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ConnectionManager::spawn(test_config(url), tx);
        wait_for(|| handle.state() == ConnectionState::Connected).await;

        let states = handle.watch_state();
        handle.shutdown().await;
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);
    }
}
