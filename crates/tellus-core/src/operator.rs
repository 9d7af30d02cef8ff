//! Run control shared between the tick driver and everything watching it.
//!
//! [`OperatorState`] lives in an `Arc`. Other tasks steer the run through it
//! (pause, resume, stop, interval changes) and the driver reports progress
//! back (last tick, faulty ticks, degraded mode). Every field is an atomic
//! or a write-once cell, so neither side ever waits on the other and the
//! observer can answer `GET /api/status` without touching the world.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::SimulationBoundsConfig;

/// Smallest tick interval accepted at runtime.
pub const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Why the tick loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationEndReason {
    /// `simulation.max_ticks` was reached.
    MaxTicksReached,
    /// `simulation.max_real_time_seconds` elapsed.
    MaxRealTimeReached,
    /// Someone called [`OperatorState::request_stop`].
    OperatorStop,
    /// The world left the running phase on its own.
    WorldStopped,
}

/// Inputs from the outside world.
#[derive(Debug)]
struct Controls {
    paused: AtomicBool,
    stop: AtomicBool,
    tick_interval_ms: AtomicU64,
    wake: Notify,
}

/// What the driver reports back.
#[derive(Debug, Default)]
struct Progress {
    last_tick: AtomicU64,
    faulty_ticks: AtomicU64,
    degraded: AtomicBool,
    end_reason: OnceLock<SimulationEndReason>,
}

/// Shared run control and progress for one simulation.
#[derive(Debug)]
pub struct OperatorState {
    controls: Controls,
    progress: Progress,
    bounds: SimulationBoundsConfig,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl OperatorState {
    /// Fresh state: running, not stopping, at `tick_interval_ms`, limited
    /// by `bounds` (zero means unlimited).
    pub fn new(tick_interval_ms: u64, bounds: &SimulationBoundsConfig) -> Self {
        Self {
            controls: Controls {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                tick_interval_ms: AtomicU64::new(tick_interval_ms),
                wake: Notify::new(),
            },
            progress: Progress::default(),
            bounds: bounds.clone(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Whether the driver is held before its next tick.
    pub fn is_paused(&self) -> bool {
        self.controls.paused.load(Ordering::Acquire)
    }

    /// Hold the driver before its next tick.
    pub fn pause(&self) {
        self.controls.paused.store(true, Ordering::Release);
    }

    /// Let a paused driver continue.
    pub fn resume(&self) {
        self.controls.paused.store(false, Ordering::Release);
        self.controls.wake.notify_one();
    }

    /// Block while paused. A stop request ends the wait too, so a paused
    /// run can still shut down.
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_stop_requested() {
            self.controls.wake.notified().await;
        }
    }

    /// Ask the driver to finish after the current tick.
    pub fn request_stop(&self) {
        self.controls.stop.store(true, Ordering::Release);
        self.controls.wake.notify_one();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.controls.stop.load(Ordering::Acquire)
    }

    /// Record why the run ended. Only the first reason sticks.
    pub fn set_end_reason(&self, reason: SimulationEndReason) {
        let _ = self.progress.end_reason.set(reason);
    }

    /// Why the run ended, once it has.
    pub fn end_reason(&self) -> Option<SimulationEndReason> {
        self.progress.end_reason.get().copied()
    }

    /// Pause between ticks, in milliseconds.
    pub fn tick_interval_ms(&self) -> u64 {
        self.controls.tick_interval_ms.load(Ordering::Acquire)
    }

    /// Change the pause between ticks. Returns the old value, or `None`
    /// (leaving it unchanged) below [`MIN_TICK_INTERVAL_MS`].
    pub fn set_tick_interval_ms(&self, ms: u64) -> Option<u64> {
        (ms >= MIN_TICK_INTERVAL_MS)
            .then(|| self.controls.tick_interval_ms.swap(ms, Ordering::AcqRel))
    }

    /// Record a completed tick.
    pub fn record_tick(&self, tick: u64, faulty: bool) {
        self.progress.last_tick.store(tick, Ordering::Release);
        if faulty {
            self.record_failed_tick();
        }
    }

    /// Record a tick the world refused outright.
    pub fn record_failed_tick(&self) {
        self.progress.faulty_ticks.fetch_add(1, Ordering::AcqRel);
    }

    /// Last completed tick.
    pub fn last_tick(&self) -> u64 {
        self.progress.last_tick.load(Ordering::Acquire)
    }

    /// Faulty and refused ticks so far.
    pub fn faulty_ticks(&self) -> u64 {
        self.progress.faulty_ticks.load(Ordering::Acquire)
    }

    /// Enter or leave degraded mode. Returns the previous value.
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.progress.degraded.swap(degraded, Ordering::AcqRel)
    }

    /// Whether the driver runs at its degraded interval.
    pub fn is_degraded(&self) -> bool {
        self.progress.degraded.load(Ordering::Acquire)
    }

    /// `true` once `current_tick` reaches a non-zero `max_ticks`.
    pub const fn tick_limit_reached(&self, current_tick: u64) -> bool {
        self.bounds.max_ticks > 0 && current_tick >= self.bounds.max_ticks
    }

    /// `true` once a non-zero `max_real_time_seconds` has elapsed.
    pub fn time_limit_reached(&self) -> bool {
        self.bounds.max_real_time_seconds > 0
            && self.elapsed_seconds() >= self.bounds.max_real_time_seconds
    }

    /// Wall-clock instant the run started.
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whole seconds since the run started, on the monotonic clock.
    pub fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Configured tick limit, 0 for none.
    pub const fn max_ticks(&self) -> u64 {
        self.bounds.max_ticks
    }

    /// Configured wall-clock limit in seconds, 0 for none.
    pub const fn max_real_time_seconds(&self) -> u64 {
        self.bounds.max_real_time_seconds
    }

    /// Point-in-time view for the status endpoint.
    pub fn status(&self) -> SimulationStatus {
        SimulationStatus {
            tick: self.last_tick(),
            paused: self.is_paused(),
            stop_requested: self.is_stop_requested(),
            degraded: self.is_degraded(),
            tick_interval_ms: self.tick_interval_ms(),
            elapsed_seconds: self.elapsed_seconds(),
            max_ticks: self.bounds.max_ticks,
            max_real_time_seconds: self.bounds.max_real_time_seconds,
            faulty_ticks: self.faulty_ticks(),
            end_reason: self.end_reason(),
            started_at: self.started_at.to_rfc3339(),
        }
    }
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStatus {
    /// Last completed tick.
    pub tick: u64,
    /// Paused by an operator.
    pub paused: bool,
    /// Stopping after the current tick.
    pub stop_requested: bool,
    /// Running at the degraded interval.
    pub degraded: bool,
    /// Pause between ticks in milliseconds.
    pub tick_interval_ms: u64,
    /// Seconds since the run started.
    pub elapsed_seconds: u64,
    /// Tick limit, 0 for none.
    pub max_ticks: u64,
    /// Wall-clock limit in seconds, 0 for none.
    pub max_real_time_seconds: u64,
    /// Ticks with at least one fault, plus refused ticks.
    pub faulty_ticks: u64,
    /// Set once the run has ended.
    pub end_reason: Option<SimulationEndReason>,
    /// RFC 3339 start time.
    pub started_at: String,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn operator(max_ticks: u64) -> OperatorState {
        OperatorState::new(
            1000,
            &SimulationBoundsConfig {
                max_ticks,
                max_real_time_seconds: 0,
            },
        )
    }

    #[test]
    fn starts_running() {
        let state = operator(0);
        assert!(!state.is_paused());
        assert!(!state.is_stop_requested());
        assert!(!state.is_degraded());
        assert_eq!(state.end_reason(), None);
    }

    #[test]
    fn pause_then_resume() {
        let state = operator(0);
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }

    #[test]
    fn interval_changes_respect_the_floor() {
        let state = operator(0);
        assert_eq!(state.set_tick_interval_ms(2000), Some(1000));
        assert!(state.set_tick_interval_ms(MIN_TICK_INTERVAL_MS.saturating_sub(1)).is_none());
        assert_eq!(state.tick_interval_ms(), 2000);
    }

    #[test]
    fn zero_limits_never_trip() {
        let state = operator(0);
        assert!(!state.tick_limit_reached(u64::MAX));
        assert!(!state.time_limit_reached());
    }

    #[test]
    fn tick_limit_is_inclusive() {
        let state = operator(100);
        assert!(!state.tick_limit_reached(99));
        assert!(state.tick_limit_reached(100));
        assert!(state.tick_limit_reached(101));
    }

    #[test]
    fn first_end_reason_wins() {
        let state = operator(0);
        state.set_end_reason(SimulationEndReason::OperatorStop);
        state.set_end_reason(SimulationEndReason::WorldStopped);
        assert_eq!(state.end_reason(), Some(SimulationEndReason::OperatorStop));
    }

    #[test]
    fn status_reflects_recorded_progress() {
        let state = OperatorState::new(500, &SimulationBoundsConfig::default());
        state.record_tick(3, false);
        state.record_tick(4, true);
        state.record_failed_tick();
        assert!(!state.set_degraded(true));
        state.set_end_reason(SimulationEndReason::OperatorStop);

        let status = state.status();
        assert_eq!(status.tick, 4);
        assert_eq!(status.faulty_ticks, 2);
        assert!(status.degraded);
        assert_eq!(status.tick_interval_ms, 500);
        assert_eq!(status.end_reason, Some(SimulationEndReason::OperatorStop));
    }

    #[tokio::test]
    async fn stop_wakes_a_paused_waiter() {
        let state = Arc::new(operator(0));
        state.pause();
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.request_stop();
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }
}
