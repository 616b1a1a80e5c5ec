//! Live position reconciliation.
//!
//! [`LiveStateStore`] is the single source of truth for "where is each agent
//! right now". Two producers feed it with no shared clock or ordering: a
//! periodic poll snapshot and the push stream. Both go through the same
//! rule:
//!
//! - a candidate with invalid coordinates is rejected;
//! - an unknown agent is inserted;
//! - a known agent is replaced only if the candidate's `observed_at` is
//!   strictly newer than the stored one;
//! - everything else is stale or a duplicate and is ignored.
//!
//! Subscribers are notified once per accepted mutation and never for a
//! rejected one, in the order the mutations were applied.
//!
//! The store only knows about data recency. It has no notion of
//! connections, and it never deletes an agent: an agent that stops
//! reporting just stops changing (see [`LiveStateStore::stale_agents`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::protocol::PushEvent;
use crate::{AgentPosition, AgentStatus, Bounds};

/// Callback invoked with the updated record after every accepted mutation.
pub type SubscriberCallback = Arc<dyn Fn(&AgentPosition) + Send + Sync>;

/// Handle returned by [`LiveStateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What happened to a candidate update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First record for this agent
    Inserted,
    /// Existing record replaced (position) or status changed
    Updated,
    /// Coordinates failed validation
    RejectedInvalid,
    /// `observed_at` not newer than the stored record
    RejectedStale,
    /// Status change for an agent with no position yet
    RejectedUnknownAgent,
    /// Status change that matches the stored status
    Unchanged,
}

impl ApplyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated)
    }
}

/// Counters of applied and rejected candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub inserted: u64,
    pub updated: u64,
    pub rejected_invalid: u64,
    pub rejected_stale: u64,
    pub rejected_unknown_agent: u64,
    pub unchanged: u64,
}

impl StoreStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::RejectedInvalid => self.rejected_invalid += 1,
            ApplyOutcome::RejectedStale => self.rejected_stale += 1,
            ApplyOutcome::RejectedUnknownAgent => self.rejected_unknown_agent += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Optional constraints for [`LiveStateStore::snapshot_filtered`].
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub statuses: Option<Vec<AgentStatus>>,
    pub region: Option<String>,
    pub bounds: Option<Bounds>,
}

impl PositionFilter {
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = AgentStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn matches(&self, position: &AgentPosition) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&position.status) {
                return false;
            }
        }
        if let Some(region) = &self.region {
            match &position.region_hint {
                Some(hint) if hint.eq_ignore_ascii_case(region) => {}
                _ => return false,
            }
        }
        if let Some(bounds) = &self.bounds {
            if !bounds.contains(position.latitude, position.longitude) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentPosition>,
    stats: StoreStats,
}

/// Canonical per-agent state, fed by the poll and push producers.
///
/// Construct one per session and share it behind an [`Arc`].
///
/// Subscriber callbacks run synchronously on the producer's thread. They may
/// read the store (`snapshot`, `get`) but must not apply updates to it.
pub struct LiveStateStore {
    inner: RwLock<Inner>,
    subscribers: RwLock<Vec<(SubscriptionId, SubscriberCallback)>>,
    // Serialises mutate-then-notify so subscribers see mutations in order.
    dispatch: Mutex<()>,
    next_subscription: AtomicU64,
}

impl Default for LiveStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            subscribers: RwLock::new(Vec::new()),
            dispatch: Mutex::new(()),
            next_subscription: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Merge a poll result. A snapshot never overwrites a fresher record,
    /// whichever channel delivered it. Returns the number of accepted rows.
    pub fn apply_poll_snapshot(&self, positions: Vec<AgentPosition>) -> usize {
        let total = positions.len();
        let accepted = positions
            .into_iter()
            .map(|p| self.apply_position(p))
            .filter(ApplyOutcome::is_accepted)
            .count();

        debug!("[LiveStateStore] Poll snapshot: {}/{} rows accepted", accepted, total);
        accepted
    }

    /// Merge one event from the push channel.
    pub fn apply_push_event(&self, event: PushEvent) -> ApplyOutcome {
        match event {
            PushEvent::LocationUpdate(position) => self.apply_position(position),
            PushEvent::StatusChange { agent_id, status, observed_at } => {
                self.apply_status(&agent_id, status, observed_at)
            }
        }
    }

    /// Last-write-wins merge of a full position.
    pub fn apply_position(&self, mut candidate: AgentPosition) -> ApplyOutcome {
        if !candidate.speed.is_finite() || candidate.speed < 0.0 {
            candidate.speed = 0.0;
        }

        let _dispatch = self.dispatch.lock();
        let (outcome, accepted) = {
            let mut inner = self.inner.write();
            let outcome = if !candidate.has_valid_coordinates() {
                ApplyOutcome::RejectedInvalid
            } else {
                match inner.agents.get(&candidate.agent_id) {
                    None => ApplyOutcome::Inserted,
                    Some(existing) if candidate.observed_at > existing.observed_at => {
                        ApplyOutcome::Updated
                    }
                    Some(_) => ApplyOutcome::RejectedStale,
                }
            };
            inner.stats.record(outcome);

            let accepted = if outcome.is_accepted() {
                inner.agents.insert(candidate.agent_id.clone(), candidate.clone());
                Some(candidate)
            } else {
                debug!(
                    "[LiveStateStore] Position for {} at {} ignored: {:?}",
                    candidate.agent_id, candidate.observed_at, outcome
                );
                None
            };
            (outcome, accepted)
        };

        if let Some(record) = &accepted {
            self.notify(record);
        }
        outcome
    }

    /// Update only the status of a known agent.
    ///
    /// With an `observed_at`, the change is rejected unless it is newer than
    /// the stored record, and an accepted change advances the record's
    /// `observed_at` so older positions can no longer overwrite it. Without
    /// one, only the status is touched.
    pub fn apply_status(&self, agent_id: &str, status: AgentStatus, observed_at: Option<i64>) -> ApplyOutcome {
        let _dispatch = self.dispatch.lock();
        let (outcome, accepted) = {
            let mut inner = self.inner.write();
            let (outcome, accepted) = match inner.agents.get_mut(agent_id) {
                None => (ApplyOutcome::RejectedUnknownAgent, None),
                Some(existing) if observed_at.is_some_and(|ts| ts <= existing.observed_at) => {
                    (ApplyOutcome::RejectedStale, None)
                }
                Some(existing) if existing.status == status && observed_at.is_none() => {
                    (ApplyOutcome::Unchanged, None)
                }
                Some(existing) => {
                    existing.status = status;
                    if let Some(ts) = observed_at {
                        existing.observed_at = ts;
                    }
                    (ApplyOutcome::Updated, Some(existing.clone()))
                }
            };
            inner.stats.record(outcome);
            (outcome, accepted)
        };

        match &accepted {
            Some(record) => self.notify(record),
            None => debug!("[LiveStateStore] Status {:?} for {} ignored: {:?}", status, agent_id, outcome),
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Register a callback for accepted mutations.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AgentPosition) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        info!("[LiveStateStore] Subscriber {:?} added", id);
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn notify(&self, record: &AgentPosition) {
        let callbacks: Vec<SubscriberCallback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(record);
        }
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Current state of every agent, ordered by agent id.
    pub fn snapshot(&self) -> Vec<AgentPosition> {
        let mut positions: Vec<AgentPosition> = self.inner.read().agents.values().cloned().collect();
        positions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        positions
    }

    /// Like [`snapshot`](Self::snapshot), restricted by status, region and/or viewport.
    pub fn snapshot_filtered(&self, filter: &PositionFilter) -> Vec<AgentPosition> {
        let mut positions: Vec<AgentPosition> = self
            .inner
            .read()
            .agents
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        positions
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentPosition> {
        self.inner.read().agents.get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agents whose last report is older than `max_age` at `now_ms`,
    /// oldest first.
    pub fn stale_agents(&self, now_ms: i64, max_age: Duration) -> Vec<AgentPosition> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let mut stale: Vec<AgentPosition> = self
            .inner
            .read()
            .agents
            .values()
            .filter(|p| p.observed_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.observed_at);
        stale
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.read().stats
    }
}

// ============================================================================
// Event sinks
// ============================================================================

/// Where the connection manager delivers decoded push events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: PushEvent);
}

impl EventSink for LiveStateStore {
    fn deliver(&self, event: PushEvent) {
        self.apply_push_event(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn deliver(&self, event: PushEvent) {
        (**self).deliver(event);
    }
}

impl EventSink for mpsc::UnboundedSender<PushEvent> {
    fn deliver(&self, event: PushEvent) {
        if self.send(event).is_err() {
            debug!("[LiveStateStore] Event receiver dropped");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
