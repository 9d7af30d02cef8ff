//! Shared application state for the observer API.
//!
//! [`AppState`] holds the latest world snapshot, a bounded tail of recent
//! events, and the broadcast channel `WebSocket` clients subscribe to. The
//! engine is the only writer: it publishes with [`AppState::try_publish`],
//! which never waits for the lock, so a slow reader can cost the observer
//! a frame but never costs the tick loop time.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tellus_core::OperatorState;
use tellus_types::{Event, WorldSnapshot};
use tokio::sync::{RwLock, broadcast};
use ts_rs::TS;

/// Capacity of the tick broadcast channel.
///
/// A subscriber that falls further behind receives
/// [`broadcast::error::RecvError::Lagged`] and skips to the newest tick.
const BROADCAST_CAPACITY: usize = 256;

/// Default number of recent events kept for `GET /api/events`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// JSON message pushed to `WebSocket` clients after every tick.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TickBroadcast {
    /// Tick just completed.
    pub tick: u64,
    /// Simulation hours after the tick.
    pub sim_time_hours: f64,
    /// Simulated calendar instant after the tick.
    pub timestamp: DateTime<Utc>,
    /// Number of agents alive.
    pub agents: usize,
    /// Number of registry entities across all subsystems.
    pub entities: usize,
    /// Number of subsystems that faulted this tick.
    pub faults: usize,
    /// Events emitted during the tick.
    pub events: Vec<Event>,
}

impl TickBroadcast {
    /// Summarize one completed tick.
    pub fn from_tick(snapshot: &WorldSnapshot, events: &[Event], faults: usize) -> Self {
        Self {
            tick: snapshot.tick,
            sim_time_hours: snapshot.sim_time_hours,
            timestamp: snapshot.taken_at,
            agents: snapshot.agents.len(),
            entities: snapshot.entity_records().count(),
            faults,
            events: events.to_vec(),
        }
    }
}

/// What REST handlers read: the newest snapshot and the event tail.
#[derive(Debug, Default)]
pub struct ObserverView {
    /// Snapshot after the most recent published tick.
    pub world: Option<Arc<WorldSnapshot>>,
    /// Recent events, oldest first.
    pub events: VecDeque<Event>,
}

/// Shared state for the Axum application.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast sender for tick messages.
    pub tx: broadcast::Sender<TickBroadcast>,
    /// Latest published view of the world.
    pub view: Arc<RwLock<ObserverView>>,
    /// Operator control state, when a simulation is attached.
    pub operator: Option<Arc<OperatorState>>,
    event_capacity: usize,
}

impl AppState {
    /// Application state with an empty view and no operator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            view: Arc::new(RwLock::new(ObserverView::default())),
            operator: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Application state reporting the given operator's status.
    pub fn with_operator(operator: Arc<OperatorState>) -> Self {
        Self {
            operator: Some(operator),
            ..Self::new()
        }
    }

    /// Keep at most `capacity` recent events (at least one).
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Subscribe to tick broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<TickBroadcast> {
        self.tx.subscribe()
    }

    /// Send a tick message to every connected client.
    ///
    /// Returns the number of receivers; zero when nobody is listening.
    pub fn broadcast(&self, message: TickBroadcast) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    /// Replace the snapshot and append events without waiting for the lock.
    ///
    /// Returns `false` if a reader held the lock; the caller keeps the
    /// events and tries again next tick.
    pub fn try_publish(&self, snapshot: Arc<WorldSnapshot>, events: &[Event]) -> bool {
        let Ok(mut view) = self.view.try_write() else {
            return false;
        };
        view.world = Some(snapshot);
        view.events.extend(events.iter().cloned());
        let excess = view.events.len().saturating_sub(self.event_capacity);
        view.events.drain(..excess);
        true
    }

    /// The newest published snapshot.
    pub async fn world(&self) -> Option<Arc<WorldSnapshot>> {
        self.view.read().await.world.clone()
    }

    /// The newest `n` events, oldest first.
    pub async fn recent_events(&self, n: usize) -> Vec<Event> {
        let view = self.view.read().await;
        let skip = view.events.len().saturating_sub(n);
        view.events.iter().skip(skip).cloned().collect()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
