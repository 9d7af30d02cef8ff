//! The tick driver.
//!
//! [`run_simulation`] calls [`World::tick`] in a loop and hands every
//! completed tick to a [`TickCallback`]. Between ticks it honors the
//! [`OperatorState`]: it waits while paused, leaves on a stop request, and
//! ends at `max_ticks` or `max_real_time_seconds`. The pause between ticks
//! is read fresh every iteration, so an operator can change speed mid-run.
//!
//! Faulty ticks are counted, never fatal. Once `failure_threshold` of them
//! arrive back to back the driver sleeps at least `degraded_interval_ms`
//! between ticks, and it returns to normal after one clean tick. When the
//! loop ends the world is stopped and the caller takes the final snapshot.

use std::sync::Arc;
use std::time::Duration;

use tellus_types::{Event, WorldSnapshot};
use tracing::{error, info, warn};

use crate::config::SimulationConfig;
use crate::operator::{OperatorState, SimulationEndReason};
use crate::world::{World, WorldError};

/// Why the driver could not run at all.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The world could not be started.
    #[error("world error: {source}")]
    World {
        /// The underlying world error.
        #[from]
        source: WorldError,
    },
}

/// Driver tuning taken from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    /// Simulated hours per tick.
    pub hours_per_tick: f64,
    /// Consecutive faulty ticks before entering degraded mode.
    pub failure_threshold: u32,
    /// Minimum interval between ticks while degraded.
    pub degraded_interval: Duration,
}

impl DriverSettings {
    /// Settings from the `world` and `driver` config sections.
    pub const fn from_config(config: &SimulationConfig) -> Self {
        Self {
            hours_per_tick: config.world.hours_per_tick,
            failure_threshold: config.driver.failure_threshold,
            degraded_interval: Duration::from_millis(config.driver.degraded_interval_ms),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&SimulationConfig::default())
    }
}

/// Everything a consumer receives about one completed tick.
///
/// Events and snapshot are shared, so handing a frame to several
/// consumers copies only reference counts.
#[derive(Debug, Clone)]
pub struct TickFrame {
    /// Tick just completed.
    pub tick: u64,
    /// Simulation hours after the tick.
    pub sim_time_hours: f64,
    /// Events of this tick in emission order.
    pub events: Arc<[Event]>,
    /// World state after the tick.
    pub snapshot: Arc<WorldSnapshot>,
    /// Number of subsystems that faulted this tick.
    pub faults: usize,
}

/// Summary returned when the loop ends.
#[derive(Debug)]
pub struct SimulationResult {
    /// Why the loop ended.
    pub end_reason: SimulationEndReason,
    /// Total number of ticks executed by this run.
    pub total_ticks: u64,
    /// Ticks with a subsystem fault or a refused tick.
    pub faulty_ticks: u64,
    /// World tick when the loop ended.
    pub final_tick: u64,
}

/// Receives every completed tick.
///
/// Implementations must only enqueue work (channel sends, `try_write`) and
/// never block the tick loop.
pub trait TickCallback: Send {
    /// Called after a tick completes.
    fn on_tick(&mut self, frame: &TickFrame);
}

/// Discards every tick.
pub struct NoOpCallback;

impl TickCallback for NoOpCallback {
    fn on_tick(&mut self, _frame: &TickFrame) {}
}

/// Consecutive-failure tracking for degraded mode.
#[derive(Debug)]
struct FaultTracker {
    consecutive: u32,
    threshold: u32,
}

impl FaultTracker {
    const fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Record a tick. Returns `Some(degraded)` when the mode changes.
    const fn record(&mut self, faulty: bool, degraded: bool) -> Option<bool> {
        if faulty {
            self.consecutive = self.consecutive.saturating_add(1);
            if !degraded && self.consecutive >= self.threshold {
                return Some(true);
            }
        } else {
            self.consecutive = 0;
            if degraded {
                return Some(false);
            }
        }
        None
    }
}

/// Drive `world` until a bound, an operator stop, or the world itself ends
/// the run.
///
/// Starts the world if it is freshly constructed. When the loop ends the
/// world is stopped and the reason is recorded on the operator state.
///
/// # Errors
///
/// Returns [`RunnerError::World`] if the world cannot be started.
pub async fn run_simulation(
    world: &mut World,
    operator: &Arc<OperatorState>,
    driver: &DriverSettings,
    callback: &mut dyn TickCallback,
) -> Result<SimulationResult, RunnerError> {
    world.start()?;
    let mut total_ticks: u64 = 0;
    let mut faulty_ticks: u64 = 0;
    let mut tracker = FaultTracker::new(driver.failure_threshold.max(1));

    info!(
        world = world.name(),
        start_tick = world.current_tick(),
        max_ticks = operator.max_ticks(),
        max_real_time_seconds = operator.max_real_time_seconds(),
        tick_interval_ms = operator.tick_interval_ms(),
        hours_per_tick = driver.hours_per_tick,
        "Simulation starting"
    );

    let end_reason = loop {
        if operator.is_paused() {
            info!(tick = world.current_tick(), "Paused");
            operator.wait_if_paused().await;
            info!(tick = world.current_tick(), "Resumed");
        }

        if operator.is_stop_requested() {
            info!(tick = world.current_tick(), "Stopping on operator request");
            break SimulationEndReason::OperatorStop;
        }

        if operator.time_limit_reached() {
            info!(
                max_seconds = operator.max_real_time_seconds(),
                elapsed = operator.elapsed_seconds(),
                "Real-time limit reached"
            );
            break SimulationEndReason::MaxRealTimeReached;
        }

        let faulty = match world.tick(driver.hours_per_tick) {
            Ok(outcome) => {
                total_ticks = total_ticks.saturating_add(1);
                let mut faulty = !outcome.is_clean();
                match world.snapshot() {
                    Ok(snapshot) => callback.on_tick(&TickFrame {
                        tick: outcome.tick,
                        sim_time_hours: outcome.sim_time_hours,
                        events: outcome.events,
                        snapshot: Arc::new(snapshot),
                        faults: outcome.faults.len(),
                    }),
                    Err(err) => {
                        error!(tick = outcome.tick, error = %err, "Snapshot after tick failed");
                        faulty = true;
                    }
                }
                operator.record_tick(outcome.tick, faulty);
                faulty
            }
            Err(WorldError::NotRunning { phase }) => {
                warn!(?phase, "World is no longer running");
                break SimulationEndReason::WorldStopped;
            }
            Err(err) => {
                error!(tick = world.current_tick(), error = %err, "Tick refused");
                operator.record_failed_tick();
                true
            }
        };
        if faulty {
            faulty_ticks = faulty_ticks.saturating_add(1);
        }

        match tracker.record(faulty, operator.is_degraded()) {
            Some(true) => {
                let _ = operator.set_degraded(true);
                warn!(
                    consecutive_faulty_ticks = tracker.consecutive,
                    degraded_interval = ?driver.degraded_interval,
                    "Entering degraded mode"
                );
            }
            Some(false) => {
                let _ = operator.set_degraded(false);
                info!(tick = world.current_tick(), "Clean tick, leaving degraded mode");
            }
            None => {}
        }

        // The tick limit counts the tick just taken.
        if operator.tick_limit_reached(world.current_tick()) {
            info!(
                tick = world.current_tick(),
                max_ticks = operator.max_ticks(),
                "Tick limit reached"
            );
            break SimulationEndReason::MaxTicksReached;
        }

        let mut interval = Duration::from_millis(operator.tick_interval_ms());
        if operator.is_degraded() {
            interval = interval.max(driver.degraded_interval);
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    };

    operator.set_end_reason(end_reason);
    world.stop();
    Ok(SimulationResult {
        end_reason,
        total_ticks,
        faulty_ticks,
        final_tick: world.current_tick(),
    })
}

/// Log the simulation end.
pub fn log_simulation_end(result: &SimulationResult) {
    info!(
        reason = ?result.end_reason,
        total_ticks = result.total_ticks,
        faulty_ticks = result.faulty_ticks,
        final_tick = result.final_tick,
        "Simulation ended"
    );
    if result.total_ticks == 0 {
        warn!("No ticks were executed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::any::Any;

    use tellus_types::SubsystemState;
    use tellus_world::{Subsystem, SubsystemError, TickContext};

    use super::*;
    use crate::config::SimulationBoundsConfig;
    use crate::world::WorldSettings;

    /// Fails on every tick up to and including `fail_until`.
    struct Flaky {
        fail_until: u64,
    }

    impl Subsystem for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            if ctx.tick <= self.fail_until {
                return Err(SubsystemError::InvalidState("not yet".to_owned()));
            }
            Ok(())
        }
        fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
            Ok(SubsystemState::default())
        }
        fn restore(&mut self, _: &SubsystemState) -> Result<(), SubsystemError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn bounded(max_ticks: u64) -> Arc<OperatorState> {
        let bounds = SimulationBoundsConfig {
            max_ticks,
            max_real_time_seconds: 0,
        };
        Arc::new(OperatorState::new(0, &bounds))
    }

    fn driver(failure_threshold: u32) -> DriverSettings {
        DriverSettings {
            hours_per_tick: 1.0,
            failure_threshold,
            degraded_interval: Duration::from_millis(1),
        }
    }

    fn flaky_world(fail_until: u64) -> World {
        World::with_subsystems(
            WorldSettings::new("runner", 1),
            vec![Box::new(Flaky { fail_until })],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn bounded_by_max_ticks() {
        let mut world = World::standard(WorldSettings::new("runner", 1)).unwrap();
        let operator = bounded(5);
        let result = run_simulation(&mut world, &operator, &driver(3), &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.end_reason, SimulationEndReason::MaxTicksReached);
        assert_eq!(result.total_ticks, 5);
        assert_eq!(result.final_tick, 5);
        assert_eq!(operator.last_tick(), 5);
        assert_eq!(world.phase(), tellus_types::WorldPhase::Stopped);
        assert_eq!(
            operator.end_reason(),
            Some(SimulationEndReason::MaxTicksReached)
        );
    }

    #[tokio::test]
    async fn operator_stop() {
        let mut world = flaky_world(0);
        let operator = bounded(0);
        operator.request_stop();
        let result = run_simulation(&mut world, &operator, &driver(3), &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.end_reason, SimulationEndReason::OperatorStop);
        assert_eq!(result.total_ticks, 0);
    }

    #[tokio::test]
    async fn stopped_world_ends_the_loop() {
        let mut world = flaky_world(0);
        world.stop();
        let operator = bounded(0);
        let result = run_simulation(&mut world, &operator, &driver(3), &mut NoOpCallback).await;
        assert!(matches!(result, Err(RunnerError::World { .. })));
    }

    #[tokio::test]
    async fn tick_callback_receives_frames() {
        struct Frames(Vec<(u64, usize)>);
        impl TickCallback for Frames {
            fn on_tick(&mut self, frame: &TickFrame) {
                assert_eq!(frame.snapshot.tick, frame.tick);
                self.0.push((frame.tick, frame.faults));
            }
        }

        let mut world = flaky_world(1);
        let operator = bounded(3);
        let mut frames = Frames(Vec::new());
        let _ = run_simulation(&mut world, &operator, &driver(3), &mut frames)
            .await
            .unwrap();
        assert_eq!(frames.0, vec![(1, 1), (2, 0), (3, 0)]);
    }

    #[tokio::test]
    async fn persistent_faults_degrade_without_ending_the_loop() {
        let mut world = flaky_world(u64::MAX);
        let operator = bounded(4);
        let result = run_simulation(&mut world, &operator, &driver(2), &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.end_reason, SimulationEndReason::MaxTicksReached);
        assert_eq!(result.total_ticks, 4);
        assert_eq!(result.faulty_ticks, 4);
        assert!(operator.is_degraded());
        assert_eq!(operator.faulty_ticks(), 4);
    }

    #[tokio::test]
    async fn one_clean_tick_recovers_from_degraded_mode() {
        let mut world = flaky_world(2);
        let operator = bounded(3);
        let result = run_simulation(&mut world, &operator, &driver(2), &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.faulty_ticks, 2);
        assert!(!operator.is_degraded());
    }

    #[test]
    fn fault_tracker_transitions() {
        let mut tracker = FaultTracker::new(2);
        assert_eq!(tracker.record(true, false), None);
        assert_eq!(tracker.record(true, false), Some(true));
        assert_eq!(tracker.record(true, true), None);
        assert_eq!(tracker.record(false, true), Some(false));
        assert_eq!(tracker.record(false, false), None);
    }

    #[tokio::test]
    async fn variable_speed_changes_interval() {
        let operator = bounded(0);
        assert_eq!(operator.tick_interval_ms(), 0);
        let _ = operator.set_tick_interval_ms(500);
        assert_eq!(operator.tick_interval_ms(), 500);
    }
}
