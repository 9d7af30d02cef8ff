//! Tick callback that fans each completed tick out to persistence and the
//! observer.
//!
//! Everything here only enqueues: events and periodic snapshots go onto
//! the persistence channel, tick messages onto the observer broadcast, and
//! the observer view is replaced with `try_write`. If a REST handler holds
//! the view lock, the tick's events wait in a small backlog and are
//! published with the next tick.

use std::sync::Arc;

use tellus_core::{TickCallback, TickFrame};
use tellus_observer::{AppState, DEFAULT_EVENT_CAPACITY, TickBroadcast};
use tellus_store::PersistenceHandle;
use tellus_types::Event;
use tracing::{debug, warn};

/// Callback bridging the tick loop to persistence and the observer.
pub struct PublishCallback {
    persistence: Option<PersistenceHandle>,
    snapshot_interval_ticks: u64,
    observer: Option<Arc<AppState>>,
    backlog: Vec<Event>,
}

impl PublishCallback {
    /// A callback with no consumers attached.
    pub const fn new(snapshot_interval_ticks: u64) -> Self {
        Self {
            persistence: None,
            snapshot_interval_ticks,
            observer: None,
            backlog: Vec::new(),
        }
    }

    /// Send events and every `snapshot_interval_ticks`-th snapshot to the
    /// persistence pipeline.
    #[must_use]
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    /// Publish every tick to the observer.
    #[must_use]
    pub fn with_observer(mut self, state: Arc<AppState>) -> Self {
        self.observer = Some(state);
        self
    }

    fn persist(&mut self, frame: &TickFrame) {
        let Some(handle) = &self.persistence else {
            return;
        };
        let snapshot_due = frame.tick.checked_rem(self.snapshot_interval_ticks) == Some(0);
        let sent = handle
            .persist_events(Arc::clone(&frame.events))
            .and_then(|()| {
                if snapshot_due {
                    handle.persist_snapshot(Arc::clone(&frame.snapshot))
                } else {
                    Ok(())
                }
            });
        if let Err(err) = sent {
            warn!(tick = frame.tick, error = %err, "Persistence unavailable, no longer persisting");
            self.persistence = None;
        }
    }

    fn observe(&mut self, frame: &TickFrame) {
        let Some(state) = &self.observer else {
            return;
        };
        let receivers = state.broadcast(TickBroadcast::from_tick(
            &frame.snapshot,
            &frame.events,
            frame.faults,
        ));

        self.backlog.extend(frame.events.iter().cloned());
        if state.try_publish(Arc::clone(&frame.snapshot), &self.backlog) {
            self.backlog.clear();
        } else {
            let excess = self.backlog.len().saturating_sub(DEFAULT_EVENT_CAPACITY);
            self.backlog.drain(..excess);
            debug!(tick = frame.tick, backlog = self.backlog.len(), "Observer view busy, deferring");
        }
        debug!(tick = frame.tick, receivers, "Tick published");
    }
}

impl TickCallback for PublishCallback {
    fn on_tick(&mut self, frame: &TickFrame) {
        self.persist(frame);
        self.observe(frame);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use tellus_core::{World, WorldSettings};
    use tellus_events::DurableWatermark;
    use tellus_store::{FileStore, PersistencePipeline};

    use super::*;

    fn frames(n: usize) -> Vec<TickFrame> {
        let mut world = World::standard(WorldSettings::new("published", 1)).unwrap();
        world.start().unwrap();
        (0..n)
            .map(|_| {
                let outcome = world.tick(1.0).unwrap();
                TickFrame {
                    tick: outcome.tick,
                    sim_time_hours: outcome.sim_time_hours,
                    events: Arc::clone(&outcome.events),
                    snapshot: Arc::new(world.snapshot().unwrap()),
                    faults: outcome.faults.len(),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn observer_catches_up_after_busy_tick() {
        let state = Arc::new(AppState::new());
        let mut callback = PublishCallback::new(10).with_observer(Arc::clone(&state));
        let mut rx = state.subscribe();
        let frames = frames(2);

        let guard = state.view.read().await;
        callback.on_tick(&frames[0]);
        drop(guard);
        assert!(state.world().await.is_none());

        callback.on_tick(&frames[1]);
        assert_eq!(state.world().await.unwrap().tick, 2);
        assert_eq!(rx.recv().await.unwrap().tick, 1);
        assert_eq!(rx.recv().await.unwrap().tick, 2);
    }

    #[tokio::test]
    async fn snapshots_follow_the_interval() {
        let root = std::env::temp_dir().join(format!("tellus-publish-{}", uuid::Uuid::new_v4()));
        let store = FileStore::open(&root).unwrap();
        let pipeline =
            PersistencePipeline::spawn(store.clone(), DurableWatermark::default(), Duration::from_secs(60));
        let mut callback = PublishCallback::new(2).with_persistence(pipeline.handle());

        let frames = frames(3);
        callback.on_tick(&frames[0]);
        pipeline.handle().flush().await.unwrap();
        assert!(store.load_snapshot().unwrap().is_none());

        callback.on_tick(&frames[1]);
        callback.on_tick(&frames[2]);
        pipeline.shutdown().await.unwrap();
        assert_eq!(store.load_snapshot().unwrap().unwrap().tick, 2);

        let _ = std::fs::remove_dir_all(&root);
    }
}
