//! Bounded, append-only log of recent tick events.
//!
//! The log keeps the events of the most recent ticks in memory, one batch
//! per tick. Batches are shared as `Arc<[Event]>` so the tick loop can
//! hand the same immutable slice to persistence and broadcast without
//! copying.
//!
//! # Retention
//!
//! A batch older than the retention window is evicted only once the
//! durable consumer has written it, i.e. once the [`DurableWatermark`]
//! covers the batch's last sequence number. If persistence falls far
//! behind, the log grows to [`HARD_CAP_FACTOR`] times the window and then
//! drops its oldest batch with a warning; the persistence channel still
//! holds its own copy, so delivery to disk stays at-least-once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tellus_types::Event;
use tracing::warn;

use crate::draft::{EventDraft, EventStamp};

/// Multiple of the retention window the log may grow to while waiting for
/// the durable consumer.
pub const HARD_CAP_FACTOR: usize = 4;

/// Shared counter of durably persisted events.
///
/// Holds the sequence number *after* the last persisted event, so
/// `covers(seq)` is `seq < value`. The persistence task advances it; the
/// tick loop only reads it.
#[derive(Debug, Clone, Default)]
pub struct DurableWatermark(Arc<AtomicU64>);

impl DurableWatermark {
    /// A watermark starting at `next_seq` (everything below is durable).
    pub fn starting_at(next_seq: u64) -> Self {
        Self(Arc::new(AtomicU64::new(next_seq)))
    }

    /// Record that every event below `next_seq` is durable. Never moves
    /// backwards.
    pub fn advance_to(&self, next_seq: u64) {
        self.0.fetch_max(next_seq, Ordering::AcqRel);
    }

    /// Whether the event with sequence `seq` has been persisted.
    pub fn covers(&self, seq: u64) -> bool {
        seq < self.0.load(Ordering::Acquire)
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct TickBatch {
    tick: u64,
    events: Arc<[Event]>,
}

/// In-memory ring of recent tick batches.
#[derive(Debug)]
pub struct EventLog {
    batches: VecDeque<TickBatch>,
    retention_ticks: usize,
    next_seq: u64,
    watermark: Option<DurableWatermark>,
}

impl EventLog {
    /// A log with no durable consumer: batches beyond the window are
    /// evicted immediately.
    pub fn new(retention_ticks: usize) -> Self {
        Self {
            batches: VecDeque::new(),
            retention_ticks: retention_ticks.max(1),
            next_seq: 0,
            watermark: None,
        }
    }

    /// Attach a durable consumer's watermark. Eviction then waits for it.
    #[must_use]
    pub fn with_watermark(mut self, watermark: DurableWatermark) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Continue numbering from `next_seq` (used when resuming a snapshot).
    pub const fn resume_from(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }

    /// Sequence number the next appended event will receive.
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Stamp a tick's drafts in order and append them as one batch.
    ///
    /// Each draft is paired with the name of the subsystem that emitted
    /// it. Returns the stamped batch.
    pub fn append(
        &mut self,
        stamp: &EventStamp,
        drafts: Vec<(&'static str, EventDraft)>,
    ) -> Arc<[Event]> {
        let mut events = Vec::with_capacity(drafts.len());
        for (subsystem, draft) in drafts {
            events.push(stamp.apply(self.next_seq, subsystem, draft));
            self.next_seq = self.next_seq.saturating_add(1);
        }
        let events: Arc<[Event]> = events.into();
        self.batches.push_back(TickBatch {
            tick: stamp.tick,
            events: Arc::clone(&events),
        });
        self.evict();
        events
    }

    fn evict(&mut self) {
        let hard_cap = self.retention_ticks.saturating_mul(HARD_CAP_FACTOR);
        while self.batches.len() > self.retention_ticks {
            let Some(oldest) = self.batches.front() else {
                break;
            };
            let drained = match (&self.watermark, oldest.events.last()) {
                (_, None) | (None, _) => true,
                (Some(watermark), Some(last)) => watermark.covers(last.seq),
            };
            if !drained {
                if self.batches.len() <= hard_cap {
                    break;
                }
                warn!(
                    tick = oldest.tick,
                    events = oldest.events.len(),
                    "Event log hard cap reached, dropping batch not yet persisted"
                );
            }
            self.batches.pop_front();
        }
    }

    /// The newest `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let mut out: Vec<Event> = self
            .batches
            .iter()
            .rev()
            .flat_map(|batch| batch.events.iter().rev())
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Events of one retained tick.
    pub fn tick_events(&self, tick: u64) -> Option<Arc<[Event]>> {
        self.batches
            .iter()
            .find(|batch| batch.tick == tick)
            .map(|batch| Arc::clone(&batch.events))
    }

    /// Number of retained tick batches.
    pub fn retained_ticks(&self) -> usize {
        self.batches.len()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|batch| batch.events.len()).sum()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|batch| batch.events.is_empty())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::{DateTime, Utc};
    use tellus_types::EventKind;

    use super::*;

    fn stamp(tick: u64) -> EventStamp {
        EventStamp {
            tick,
            sim_time_hours: 0.0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn drafts(n: usize) -> Vec<(&'static str, EventDraft)> {
        (0..n)
            .map(|_| ("test", EventDraft::new(EventKind::ThresholdCrossed)))
            .collect()
    }

    #[test]
    fn sequence_numbers_are_global_and_ordered() {
        let mut log = EventLog::new(10);
        let first = log.append(&stamp(1), drafts(2));
        let second = log.append(&stamp(2), drafts(3));
        assert_eq!(first[0].seq, 0);
        assert_eq!(first[1].seq, 1);
        assert_eq!(second[0].seq, 2);
        assert_eq!(log.next_seq(), 5);

        let recent = log.recent(4);
        let seqs: Vec<u64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn evicts_beyond_window_without_durable_consumer() {
        let mut log = EventLog::new(2);
        for tick in 1..=5 {
            let _ = log.append(&stamp(tick), drafts(1));
        }
        assert_eq!(log.retained_ticks(), 2);
        assert!(log.tick_events(3).is_none());
        assert!(log.tick_events(5).is_some());
    }

    #[test]
    fn eviction_waits_for_watermark() {
        let watermark = DurableWatermark::default();
        let mut log = EventLog::new(2).with_watermark(watermark.clone());
        for tick in 1..=4 {
            let _ = log.append(&stamp(tick), drafts(1));
        }
        // Nothing persisted yet: all four batches are kept (below hard cap).
        assert_eq!(log.retained_ticks(), 4);

        // Persist the first two events, then append again.
        watermark.advance_to(2);
        let _ = log.append(&stamp(5), drafts(1));
        assert_eq!(log.retained_ticks(), 3);
        assert!(log.tick_events(1).is_none());
        assert!(log.tick_events(3).is_some());
    }

    #[test]
    fn hard_cap_bounds_memory_when_persistence_stalls() {
        let watermark = DurableWatermark::default();
        let mut log = EventLog::new(1).with_watermark(watermark);
        for tick in 1..=10 {
            let _ = log.append(&stamp(tick), drafts(1));
        }
        assert_eq!(log.retained_ticks(), HARD_CAP_FACTOR);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let watermark = DurableWatermark::starting_at(10);
        watermark.advance_to(4);
        assert_eq!(watermark.value(), 10);
        assert!(watermark.covers(9));
        assert!(!watermark.covers(10));
    }
}
