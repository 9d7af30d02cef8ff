//! Background persistence task.
//!
//! The tick loop never touches the filesystem. It enqueues event batches
//! and snapshots on an unbounded channel through a [`PersistenceHandle`];
//! a single worker task writes them with [`FileStore`] on the blocking
//! pool.
//!
//! # Delivery
//!
//! ```text
//! tick loop --Events/Snapshot--> channel --> worker --spawn_blocking--> FileStore
//!                                              |
//!                                              +-- retry queue (on failure)
//!                                              +-- DurableWatermark (on success)
//! ```
//!
//! Events are written strictly in arrival order, at most [`WRITE_BATCH`]
//! per blocking job. A failed write keeps the failed event and everything
//! after it queued; the queue is retried on the next command or the next
//! retry interval, whichever comes first. The queue holds at most
//! `max_pending_events`; past that the oldest unwritten events are dropped
//! with a warning. Only the newest pending snapshot is kept. Each contiguous run of
//! written events advances the [`DurableWatermark`], which lets the
//! in-memory event log evict old batches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tellus_events::DurableWatermark;
use tellus_types::{Event, WorldSnapshot};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::file_store::FileStore;

/// Backlog limit used by [`PersistencePipeline::spawn`].
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 100_000;

/// Most events handed to one blocking write job.
pub const WRITE_BATCH: usize = 512;

/// A request to the persistence worker.
#[derive(Debug)]
pub enum PersistCommand {
    /// Append one tick's events.
    Events(Arc<[Event]>),
    /// Replace the pending snapshot.
    Snapshot(Arc<WorldSnapshot>),
    /// Write everything pending, then reply.
    Flush(oneshot::Sender<PersistReport>),
    /// Write everything pending, reply, and exit.
    Shutdown(oneshot::Sender<PersistReport>),
}

/// Backlog left after a flush or shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    /// Events still waiting to be written.
    pub pending_events: usize,
    /// Whether a snapshot is still waiting to be written.
    pub pending_snapshot: bool,
    /// Sequence number after the last durable event.
    pub watermark: u64,
    /// Unwritten events discarded because the backlog was full.
    pub dropped_events: u64,
}

impl PersistReport {
    /// Whether nothing is left to write.
    pub const fn is_clean(&self) -> bool {
        self.pending_events == 0 && !self.pending_snapshot
    }
}

/// Cheap, clonable sender side of the pipeline.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceHandle {
    /// Enqueue one tick's events. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if the worker has exited.
    pub fn persist_events(&self, events: Arc<[Event]>) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        self.send(PersistCommand::Events(events))
    }

    /// Enqueue a snapshot, replacing any snapshot not yet written. Never
    /// blocks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if the worker has exited.
    pub fn persist_snapshot(&self, snapshot: Arc<WorldSnapshot>) -> Result<(), StoreError> {
        self.send(PersistCommand::Snapshot(snapshot))
    }

    /// Wait until everything enqueued so far has been attempted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if the worker has exited.
    pub async fn flush(&self) -> Result<PersistReport, StoreError> {
        let (reply, response) = oneshot::channel();
        self.send(PersistCommand::Flush(reply))?;
        response.await.ok().ok_or(StoreError::Closed)
    }

    fn send(&self, command: PersistCommand) -> Result<(), StoreError> {
        if self.tx.send(command).is_err() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Owner of the persistence worker task.
#[derive(Debug)]
pub struct PersistencePipeline {
    handle: PersistenceHandle,
    worker: JoinHandle<PersistReport>,
}

impl PersistencePipeline {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// `watermark` is advanced as events become durable; pass the one the
    /// world's event log was built with.
    pub fn spawn(store: FileStore, watermark: DurableWatermark, retry_interval: Duration) -> Self {
        Self::spawn_with_backlog(store, watermark, retry_interval, DEFAULT_MAX_PENDING_EVENTS)
    }

    /// Like [`spawn`](Self::spawn), holding at most `max_pending_events`
    /// unwritten events (at least one).
    pub fn spawn_with_backlog(
        store: FileStore,
        watermark: DurableWatermark,
        retry_interval: Duration,
        max_pending_events: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            store,
            watermark,
            pending_events: VecDeque::new(),
            pending_snapshot: None,
            max_pending_events: max_pending_events.max(1),
            dropped_events: 0,
            failing: false,
        };
        let worker = tokio::spawn(worker.run(rx, retry_interval));
        Self {
            handle: PersistenceHandle { tx },
            worker,
        }
    }

    /// A sender for the tick loop and other producers.
    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Write everything pending, stop the worker, and wait for it.
    ///
    /// Commands sent by other handles before this call are still written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if the worker already exited and
    /// [`StoreError::Task`] if it panicked.
    pub async fn shutdown(self) -> Result<PersistReport, StoreError> {
        let (reply, response) = oneshot::channel();
        self.handle.send(PersistCommand::Shutdown(reply))?;
        let report = response.await.ok();
        let joined = self
            .worker
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?;
        Ok(report.unwrap_or(joined))
    }
}

struct Worker {
    store: FileStore,
    watermark: DurableWatermark,
    pending_events: VecDeque<Event>,
    pending_snapshot: Option<Arc<WorldSnapshot>>,
    max_pending_events: usize,
    dropped_events: u64,
    failing: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PersistCommand>,
        retry_interval: Duration,
    ) -> PersistReport {
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        self.drain().await;
                        debug!("Persistence channel closed");
                        return self.report();
                    };
                    if let PersistCommand::Shutdown(reply) = command {
                        rx.close();
                        let mut replies = vec![reply];
                        while let Ok(command) = rx.try_recv() {
                            if let Some(reply) = self.absorb(command) {
                                replies.push(reply);
                            }
                        }
                        self.drain().await;
                        let report = self.report();
                        for reply in replies {
                            let _ = reply.send(report);
                        }
                        info!(
                            pending_events = report.pending_events,
                            pending_snapshot = report.pending_snapshot,
                            watermark = report.watermark,
                            dropped_events = report.dropped_events,
                            "Persistence pipeline stopped"
                        );
                        return report;
                    }
                    let reply = self.absorb(command);
                    self.drain().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(self.report());
                    }
                }
                _ = retry.tick(), if self.has_pending() => {
                    self.drain().await;
                }
            }
        }
    }

    /// Queue a command's payload; hand back its reply channel, if any.
    fn absorb(&mut self, command: PersistCommand) -> Option<oneshot::Sender<PersistReport>> {
        match command {
            PersistCommand::Events(events) => {
                self.pending_events.extend(events.iter().cloned());
                self.shed_overflow();
                None
            }
            PersistCommand::Snapshot(snapshot) => {
                self.pending_snapshot = Some(snapshot);
                None
            }
            PersistCommand::Flush(reply) | PersistCommand::Shutdown(reply) => Some(reply),
        }
    }

    /// Drop the oldest unwritten events beyond the backlog limit.
    fn shed_overflow(&mut self) {
        let excess = self
            .pending_events
            .len()
            .saturating_sub(self.max_pending_events);
        if excess == 0 {
            return;
        }
        let first_seq = self.pending_events.front().map(|event| event.seq);
        self.pending_events.drain(..excess);
        self.dropped_events = self
            .dropped_events
            .saturating_add(u64::try_from(excess).unwrap_or(u64::MAX));
        warn!(
            dropped = excess,
            first_seq = ?first_seq,
            backlog = self.pending_events.len(),
            total_dropped = self.dropped_events,
            "Persistence backlog full, oldest unwritten events dropped"
        );
    }

    fn has_pending(&self) -> bool {
        !self.pending_events.is_empty() || self.pending_snapshot.is_some()
    }

    fn report(&self) -> PersistReport {
        PersistReport {
            pending_events: self.pending_events.len(),
            pending_snapshot: self.pending_snapshot.is_some(),
            watermark: self.watermark.value(),
            dropped_events: self.dropped_events,
        }
    }

    async fn drain(&mut self) {
        let events_ok = self.write_events().await;
        let snapshot_ok = self.write_snapshot().await;
        let ok = events_ok && snapshot_ok;
        if ok && self.failing {
            info!(
                watermark = self.watermark.value(),
                "Persistence recovered"
            );
        }
        self.failing = !ok;
    }

    async fn write_events(&mut self) -> bool {
        while !self.pending_events.is_empty() {
            let batch: Vec<Event> = self
                .pending_events
                .iter()
                .take(WRITE_BATCH)
                .cloned()
                .collect();
            let store = self.store.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut written: usize = 0;
                for event in &batch {
                    if let Err(err) = store.save_event(event) {
                        return (written, Some(err));
                    }
                    written = written.saturating_add(1);
                }
                (written, None)
            })
            .await;

            let (written, failure) = match outcome {
                Ok(outcome) => outcome,
                Err(err) => (0, Some(StoreError::Task(err.to_string()))),
            };
            let mut last_seq = None;
            for _ in 0..written {
                if let Some(event) = self.pending_events.pop_front() {
                    last_seq = Some(event.seq);
                }
            }
            if let Some(seq) = last_seq {
                self.watermark.advance_to(seq.saturating_add(1));
            }
            if let Some(err) = failure {
                error!(
                    error = %err,
                    written,
                    pending = self.pending_events.len(),
                    "Event write failed, will retry"
                );
                return false;
            }
            debug!(written, watermark = self.watermark.value(), "Events persisted");
        }
        true
    }

    async fn write_snapshot(&mut self) -> bool {
        let Some(snapshot) = self.pending_snapshot.take() else {
            return true;
        };
        let store = self.store.clone();
        let job = Arc::clone(&snapshot);
        let outcome = tokio::task::spawn_blocking(move || store.save_snapshot(&job))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))
            .and_then(|written| written);
        match outcome {
            Ok(_) => true,
            Err(err) => {
                error!(
                    error = %err,
                    tick = snapshot.tick,
                    "Snapshot write failed, will retry"
                );
                self.pending_snapshot = Some(snapshot);
                false
            }
        }
    }
}
