//! The world: sole owner of simulation state and the tick orchestrator.
//!
//! A [`World`] holds the clock, the agent directory, the signal board, the
//! event log, and an ordered list of subsystems. [`World::tick`] is the
//! only place simulated time moves:
//!
//! 1. Refuse unless the world is running and `dt` is a valid step.
//! 2. Drain drafts queued between ticks (world first, then each subsystem
//!    in order).
//! 3. Run each subsystem's `update` in registration order, applying its
//!    agent effects as soon as it returns.
//! 4. Stamp every draft with the new tick, hours, calendar instant, and a
//!    global sequence number.
//! 5. Advance the clock exactly once.
//! 6. Append the batch to the event log and return it.
//!
//! A subsystem that returns an error or panics is isolated: what it emitted
//! before failing is kept, a `subsystem_error` event is added, and the
//! remaining subsystems still run.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tellus_events::{DurableWatermark, EventDraft, EventLog, EventStamp};
use tellus_types::{
    AgentRecord, Event, EventKind, PendingEvent, PropertyMap, SNAPSHOT_FORMAT_VERSION,
    SubsystemState, WorldPhase, WorldSnapshot,
};
use tellus_world::{AgentDirectory, EvolveStamp, SeedSource, Subsystem, SubsystemError, TickContext};
use tracing::{debug, error, info, warn};

use crate::clock::{ClockError, SimClock};
use crate::config::SimulationConfig;

/// Subsystem label for events the world itself emits.
pub const WORLD_SOURCE: &str = "world";

/// Error class recorded when a subsystem panics.
pub const PANIC_CLASS: &str = "panic";

/// Errors returned by world operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// `tick` was called outside the running phase.
    #[error("world is {phase:?}, ticks are only accepted while running")]
    NotRunning {
        /// The phase the world was in.
        phase: WorldPhase,
    },

    /// `start` was called on a stopped world.
    #[error("world is stopped and cannot be restarted")]
    AlreadyStopped,

    /// The clock refused the step.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// Two subsystems share a name.
    #[error("duplicate subsystem name: {name}")]
    DuplicateSubsystem {
        /// The repeated name.
        name: String,
    },

    /// A subsystem failed to snapshot or restore.
    #[error("subsystem {name} state error: {source}")]
    SubsystemState {
        /// The failing subsystem.
        name: String,
        /// The underlying error.
        source: SubsystemError,
    },

    /// The snapshot was written by a newer format.
    #[error("unsupported snapshot format version {found} (supported up to {supported})")]
    UnsupportedFormat {
        /// Version found in the snapshot.
        found: u32,
        /// Highest version this build reads.
        supported: u32,
    },
}

/// Identity and tuning of a world, independent of its subsystems.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSettings {
    /// Human-readable name.
    pub name: String,
    /// Root seed of every random stream.
    pub seed: u64,
    /// Calendar instant of simulated hour 0.
    pub epoch: DateTime<Utc>,
    /// Ticks of events kept in memory.
    pub event_retention_ticks: usize,
    /// Update time after which a subsystem is reported as slow.
    pub watchdog_budget: Duration,
}

impl WorldSettings {
    /// Settings with the given name and seed and default tuning.
    pub fn new(name: impl Into<String>, seed: u64) -> Self {
        Self {
            name: name.into(),
            seed,
            epoch: DateTime::<Utc>::UNIX_EPOCH,
            event_retention_ticks: 100,
            watchdog_budget: Duration::from_millis(250),
        }
    }

    /// Settings from the `world` and `persistence` config sections.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidEpoch`] for an unrepresentable epoch
    /// year.
    pub fn from_config(config: &SimulationConfig) -> Result<Self, ClockError> {
        Ok(Self {
            name: config.world.name.clone(),
            seed: config.world.seed,
            epoch: SimClock::epoch_for_year(config.world.epoch_year)?,
            event_retention_ticks: config.persistence.event_retention_ticks,
            watchdog_budget: Duration::from_millis(config.world.watchdog_ms),
        })
    }
}

/// A subsystem failure caught during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemFault {
    /// Name of the failing subsystem.
    pub subsystem: &'static str,
    /// Short class of the failure (`registry`, `invalid_state`, `panic`, ...).
    pub error_class: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// Result of one successful [`World::tick`].
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Tick the world now holds.
    pub tick: u64,
    /// Simulation hours after the tick.
    pub sim_time_hours: f64,
    /// Stamped events of this tick, in emission order.
    pub events: Arc<[Event]>,
    /// Subsystems that failed during this tick.
    pub faults: Vec<SubsystemFault>,
}

impl TickOutcome {
    /// Whether every subsystem completed normally.
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// The simulated world.
pub struct World {
    name: String,
    phase: WorldPhase,
    clock: SimClock,
    seeds: SeedSource,
    agents: AgentDirectory,
    signals: PropertyMap,
    subsystems: Vec<Box<dyn Subsystem>>,
    log: EventLog,
    retention_ticks: usize,
    pending: Vec<EventDraft>,
    watchdog_budget: Duration,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("tick", &self.clock.tick())
            .field("hours", &self.clock.hours())
            .field("agents", &self.agents.len())
            .field("subsystems", &self.subsystem_names())
            .finish_non_exhaustive()
    }
}

impl World {
    /// A world running the given subsystems in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::DuplicateSubsystem`] if two subsystems report
    /// the same name.
    pub fn with_subsystems(
        settings: WorldSettings,
        subsystems: Vec<Box<dyn Subsystem>>,
    ) -> Result<Self, WorldError> {
        let mut seen = BTreeSet::new();
        for subsystem in &subsystems {
            if !seen.insert(subsystem.name()) {
                return Err(WorldError::DuplicateSubsystem {
                    name: subsystem.name().to_owned(),
                });
            }
        }
        info!(
            world = %settings.name,
            seed = settings.seed,
            subsystems = subsystems.len(),
            "World constructed"
        );
        Ok(Self {
            name: settings.name,
            phase: WorldPhase::Constructed,
            clock: SimClock::new(settings.epoch),
            seeds: SeedSource::new(settings.seed),
            agents: AgentDirectory::new(),
            signals: PropertyMap::new(),
            subsystems,
            log: EventLog::new(settings.event_retention_ticks),
            retention_ticks: settings.event_retention_ticks,
            pending: Vec::new(),
            watchdog_budget: settings.watchdog_budget,
        })
    }

    /// A world running the six standard subsystems.
    ///
    /// # Errors
    ///
    /// See [`with_subsystems`](Self::with_subsystems).
    pub fn standard(settings: WorldSettings) -> Result<Self, WorldError> {
        Self::with_subsystems(settings, tellus_systems::standard_subsystems())
    }

    /// Make event-log eviction wait for a durable consumer.
    #[must_use]
    pub fn with_watermark(mut self, watermark: DurableWatermark) -> Self {
        let mut log = EventLog::new(self.retention_ticks).with_watermark(watermark);
        log.resume_from(self.log.next_seq());
        self.log = log;
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Enter the running phase. Starting a running world is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::AlreadyStopped`] for a stopped world.
    pub fn start(&mut self) -> Result<(), WorldError> {
        match self.phase {
            WorldPhase::Stopped => Err(WorldError::AlreadyStopped),
            WorldPhase::Running => Ok(()),
            WorldPhase::Constructed => {
                self.phase = WorldPhase::Running;
                info!(world = %self.name, tick = self.clock.tick(), "World started");
                Ok(())
            }
        }
    }

    /// Enter the terminal stopped phase.
    pub fn stop(&mut self) {
        if self.phase != WorldPhase::Stopped {
            self.phase = WorldPhase::Stopped;
            info!(world = %self.name, tick = self.clock.tick(), "World stopped");
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the world by `dt` simulated hours.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::NotRunning`] outside the running phase and
    /// [`WorldError::Clock`] for a negative or non-finite `dt`. In both
    /// cases nothing has changed.
    pub fn tick(&mut self, dt: f64) -> Result<TickOutcome, WorldError> {
        if self.phase != WorldPhase::Running {
            return Err(WorldError::NotRunning { phase: self.phase });
        }
        let step = self.clock.next_step(dt)?;

        let mut drafts: Vec<(&'static str, EventDraft)> = self
            .pending
            .drain(..)
            .map(|draft| (WORLD_SOURCE, draft))
            .collect();
        for subsystem in &mut self.subsystems {
            let name = subsystem.name();
            drafts.extend(subsystem.take_pending().into_iter().map(|draft| (name, draft)));
        }

        let stamp = EvolveStamp {
            seeds: self.seeds,
            tick: step.tick,
            now_hours: step.hours,
            dt: step.dt,
        };
        let mut faults = Vec::new();
        for subsystem in &mut self.subsystems {
            let name = subsystem.name();
            let started = Instant::now();
            let mut ctx = TickContext::new(stamp, &self.agents, &mut self.signals);
            let result = catch_unwind(AssertUnwindSafe(|| subsystem.update(&mut ctx)));
            let (emitted, effects) = ctx.into_parts();
            let elapsed = started.elapsed();
            if elapsed > self.watchdog_budget {
                warn!(
                    subsystem = name,
                    tick = step.tick,
                    elapsed = ?elapsed,
                    budget = ?self.watchdog_budget,
                    "Subsystem update exceeded its time budget"
                );
            }

            drafts.extend(emitted.into_iter().map(|draft| (name, draft)));
            for effect in effects {
                let _ = self.agents.apply(effect);
            }

            let fault = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(SubsystemFault {
                    subsystem: name,
                    error_class: err.class(),
                    message: err.to_string(),
                }),
                Err(payload) => Some(SubsystemFault {
                    subsystem: name,
                    error_class: PANIC_CLASS,
                    message: panic_message(payload.as_ref()),
                }),
            };
            if let Some(fault) = fault {
                error!(
                    subsystem = fault.subsystem,
                    error_class = fault.error_class,
                    tick = step.tick,
                    error = %fault.message,
                    "Subsystem update failed, continuing with the next subsystem"
                );
                drafts.push((
                    name,
                    EventDraft::new(EventKind::SubsystemError)
                        .with("subsystem", fault.subsystem)
                        .with("error_class", fault.error_class)
                        .with("message", fault.message.as_str()),
                ));
                faults.push(fault);
            }
        }

        self.clock.commit(step);
        let event_stamp = EventStamp {
            tick: self.clock.tick(),
            sim_time_hours: self.clock.hours(),
            timestamp: self.clock.now(),
        };
        let events = self.log.append(&event_stamp, drafts);
        debug!(
            tick = event_stamp.tick,
            hours = event_stamp.sim_time_hours,
            events = events.len(),
            faults = faults.len(),
            "Tick complete"
        );

        Ok(TickOutcome {
            tick: event_stamp.tick,
            sim_time_hours: event_stamp.sim_time_hours,
            events,
            faults,
        })
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    /// Serialize the whole world.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::SubsystemState`] if a subsystem cannot
    /// serialize its registries.
    pub fn snapshot(&self) -> Result<WorldSnapshot, WorldError> {
        let mut subsystems = BTreeMap::new();
        for subsystem in &self.subsystems {
            let state = subsystem
                .snapshot()
                .map_err(|source| WorldError::SubsystemState {
                    name: subsystem.name().to_owned(),
                    source,
                })?;
            subsystems.insert(subsystem.name().to_owned(), state);
        }
        Ok(WorldSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            world_name: self.name.clone(),
            seed: self.seeds.seed(),
            tick: self.clock.tick(),
            sim_time_hours: self.clock.hours(),
            taken_at: self.clock.now(),
            phase: self.phase,
            next_event_seq: self.log.next_seq(),
            agents: self.agents.records(),
            signals: self.signals.clone(),
            subsystems,
            pending: self.pending.iter().cloned().map(PendingEvent::from).collect(),
        })
    }

    /// Replace this world's state with a snapshot.
    ///
    /// The world returns to the constructed phase so the caller decides
    /// when ticking resumes. Drafts queued before the restore are replaced
    /// by the ones the snapshot carries, which go out with the next tick.
    /// Subsystems absent from the snapshot restore from empty
    /// state; snapshot sections for unknown subsystems are ignored with a
    /// warning. On error the world is left partially restored and should
    /// be discarded.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::UnsupportedFormat`] for a newer format,
    /// [`WorldError::Clock`] for invalid hours, or
    /// [`WorldError::SubsystemState`] if a subsystem rejects its state.
    pub fn restore(&mut self, snapshot: &WorldSnapshot) -> Result<(), WorldError> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(WorldError::UnsupportedFormat {
                found: snapshot.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let clock = SimClock::from_parts(snapshot.tick, snapshot.sim_time_hours, self.clock.epoch())?;

        let empty = SubsystemState::default();
        for subsystem in &mut self.subsystems {
            let name = subsystem.name();
            let state = snapshot.subsystems.get(name).unwrap_or(&empty);
            subsystem
                .restore(state)
                .map_err(|source| WorldError::SubsystemState {
                    name: name.to_owned(),
                    source,
                })?;
        }
        for name in snapshot.subsystems.keys() {
            if !self.subsystems.iter().any(|s| s.name() == name) {
                warn!(subsystem = %name, "Snapshot section for unknown subsystem ignored");
            }
        }

        self.name.clone_from(&snapshot.world_name);
        self.seeds = SeedSource::new(snapshot.seed);
        self.clock = clock;
        self.agents = AgentDirectory::from_records(snapshot.agents.clone());
        self.signals.clone_from(&snapshot.signals);
        self.log.resume_from(snapshot.next_event_seq);
        self.pending = snapshot.pending.iter().cloned().map(EventDraft::from).collect();
        self.phase = WorldPhase::Constructed;
        info!(
            world = %self.name,
            tick = self.clock.tick(),
            agents = self.agents.len(),
            entities = snapshot.entity_count(),
            "World restored from snapshot"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Add an agent. The `agent_spawned` event is emitted with the next
    /// tick. Returns `false` if the id is taken.
    pub fn spawn_agent(&mut self, agent: AgentRecord) -> bool {
        let draft = EventDraft::new(EventKind::AgentSpawned)
            .about(agent.id.as_str())
            .with("name", agent.name.as_str())
            .with("longitude", agent.position.longitude)
            .with("latitude", agent.position.latitude);
        if !self.agents.insert(agent) {
            return false;
        }
        self.pending.push(draft);
        true
    }

    /// Remove an agent. The `agent_removed` event is emitted with the next
    /// tick. Edges naming the agent in registries are left to their owners.
    pub fn remove_agent(&mut self, id: &str) -> Option<AgentRecord> {
        let removed = self.agents.remove(id)?;
        self.pending.push(
            EventDraft::new(EventKind::AgentRemoved)
                .about(id)
                .with("name", removed.name.as_str()),
        );
        Some(removed)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Typed read access to a subsystem.
    pub fn subsystem<T: Subsystem>(&self) -> Option<&T> {
        self.subsystems
            .iter()
            .find_map(|subsystem| subsystem.as_any().downcast_ref::<T>())
    }

    /// Typed mutable access to a subsystem, for external mutators between
    /// ticks.
    pub fn subsystem_mut<T: Subsystem>(&mut self) -> Option<&mut T> {
        self.subsystems
            .iter_mut()
            .find_map(|subsystem| subsystem.as_any_mut().downcast_mut::<T>())
    }

    /// Subsystem names in update order.
    pub fn subsystem_names(&self) -> Vec<&'static str> {
        self.subsystems.iter().map(|subsystem| subsystem.name()).collect()
    }

    /// World name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root seed.
    pub const fn seed(&self) -> u64 {
        self.seeds.seed()
    }

    /// Current phase.
    pub const fn phase(&self) -> WorldPhase {
        self.phase
    }

    /// Current tick.
    pub const fn current_tick(&self) -> u64 {
        self.clock.tick()
    }

    /// Simulation hours elapsed.
    pub const fn sim_time_hours(&self) -> f64 {
        self.clock.hours()
    }

    /// The simulation clock.
    pub const fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// The population.
    pub const fn agents(&self) -> &AgentDirectory {
        &self.agents
    }

    /// Published signals.
    pub const fn signals(&self) -> &PropertyMap {
        &self.signals
    }

    /// The in-memory event log.
    pub const fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// The newest `n` retained events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.log.recent(n)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use tellus_systems::economy::Basket;
    use tellus_systems::{
        CrisisSystem, CultureSystem, EconomySystem, EnvironmentSystem, JusticeSystem,
        SocietySystem, STANDARD_ORDER,
    };
    use tellus_types::{Position, PropertyMapExt};
    use tellus_world::{AgentEffect, NewEntity};

    use super::*;

    fn settings(seed: u64) -> WorldSettings {
        WorldSettings::new("test", seed)
    }

    fn agent(id: &str, longitude: f64, latitude: f64) -> AgentRecord {
        AgentRecord {
            id: id.to_owned(),
            name: id.to_uppercase(),
            position: Position::new(longitude, latitude),
            attributes: PropertyMap::new(),
            born_at_hours: 0.0,
        }
    }

    /// Emits one event per update.
    struct Chatter(&'static str);

    impl Subsystem for Chatter {
        fn name(&self) -> &'static str {
            self.0
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            ctx.emit(EventDraft::new(EventKind::ThresholdCrossed).about(self.0));
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

    /// Emits one event, then fails in the configured way.
    struct Faulty {
        panics: bool,
    }

    impl Subsystem for Faulty {
        fn name(&self) -> &'static str {
            if self.panics { "panicky" } else { "failing" }
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            ctx.emit(EventDraft::new(EventKind::ThresholdCrossed).about("before-fault"));
            ctx.queue_effect(AgentEffect::SetAttribute {
                agent: "a1".to_owned(),
                key: "touched".to_owned(),
                value: true.into(),
            });
            if self.panics {
                panic!("boom");
            }
            Err(SubsystemError::InvalidState("ledger out of balance".to_owned()))
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

    /// Moves agent `a1` east by one degree each tick.
    struct Mover;

    impl Subsystem for Mover {
        fn name(&self) -> &'static str {
            "mover"
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            if let Some(agent) = ctx.agents.get("a1") {
                let position = Position::new(agent.position.longitude + 1.0, agent.position.latitude);
                ctx.queue_effect(AgentEffect::Relocate {
                    agent: "a1".to_owned(),
                    position,
                });
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

    /// Publishes where it sees agent `a1`.
    struct Watcher;

    impl Subsystem for Watcher {
        fn name(&self) -> &'static str {
            "watcher"
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            let longitude = ctx.agents.get("a1").map_or(-1.0, |a| a.position.longitude);
            ctx.publish("watcher.longitude", longitude);
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

    fn populated(seed: u64) -> World {
        let mut world = World::standard(settings(seed)).unwrap();
        for (i, id) in ["a1", "a2", "a3", "a4"].iter().enumerate() {
            let offset = f64::from(u8::try_from(i).unwrap());
            assert!(world.spawn_agent(agent(id, 10.0 + offset, 20.0)));
        }
        let environment = world.subsystem_mut::<EnvironmentSystem>().unwrap();
        for region in ["lowlands", "highlands"] {
            assert!(environment.create_region(
                NewEntity::new(region, "region")
                    .property("longitude", 10.0)
                    .property("latitude", 20.0)
            ));
        }
        let economy = world.subsystem_mut::<EconomySystem>().unwrap();
        assert!(economy.open_exchange(NewEntity::new("main", "market")));
        let society = world.subsystem_mut::<SocietySystem>().unwrap();
        assert!(society.found_group(NewEntity::new("river_folk", "clan")));
        assert!(society.join_group("river_folk", "a1"));
        let justice = world.subsystem_mut::<JusticeSystem>().unwrap();
        assert!(justice.propose_law(NewEntity::new("no_theft", "property")));
        let crisis = world.subsystem_mut::<CrisisSystem>().unwrap();
        assert!(crisis.declare_crisis(
            NewEntity::new("flood", "flood")
                .property("severity", 0.5)
                .property("longitude", 10.0)
                .property("latitude", 20.0)
        ));
        let culture = world.subsystem_mut::<CultureSystem>().unwrap();
        assert!(culture.create_language(NewEntity::new("proto", "spoken")));
        world.start().unwrap();
        world
    }

    #[test]
    fn standard_world_runs_subsystems_in_fixed_order() {
        let world = World::standard(settings(1)).unwrap();
        assert_eq!(world.subsystem_names(), STANDARD_ORDER);
        assert!(world.subsystem::<CultureSystem>().is_some());
    }

    #[test]
    fn duplicate_subsystem_names_are_rejected() {
        let result = World::with_subsystems(
            settings(1),
            vec![Box::new(Chatter("twin")), Box::new(Chatter("twin"))],
        );
        assert!(matches!(
            result,
            Err(WorldError::DuplicateSubsystem { name }) if name == "twin"
        ));
    }

    #[test]
    fn ticks_only_while_running() {
        let mut world = World::with_subsystems(settings(1), vec![Box::new(Chatter("c"))]).unwrap();
        assert!(matches!(
            world.tick(1.0),
            Err(WorldError::NotRunning {
                phase: WorldPhase::Constructed
            })
        ));
        world.start().unwrap();
        assert!(world.tick(1.0).is_ok());
        world.stop();
        assert!(matches!(
            world.tick(1.0),
            Err(WorldError::NotRunning {
                phase: WorldPhase::Stopped
            })
        ));
        assert!(matches!(world.start(), Err(WorldError::AlreadyStopped)));
        assert_eq!(world.current_tick(), 1);
    }

    #[test]
    fn invalid_step_changes_nothing() {
        let mut world = World::with_subsystems(settings(1), vec![Box::new(Chatter("c"))]).unwrap();
        world.start().unwrap();
        assert!(world.spawn_agent(agent("a1", 0.0, 0.0)));
        for dt in [-1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(world.tick(dt), Err(WorldError::Clock { .. })));
        }
        assert_eq!(world.current_tick(), 0);
        assert_eq!(world.event_log().next_seq(), 0);

        // The spawn draft is still pending and goes out with the next tick.
        let outcome = world.tick(1.0).unwrap();
        assert_eq!(outcome.events[0].kind, EventKind::AgentSpawned);
        assert_eq!(outcome.events[0].subsystem, WORLD_SOURCE);
    }

    #[test]
    fn tick_and_clock_advance_exactly_once_per_call() {
        let mut world = World::with_subsystems(settings(1), vec![Box::new(Chatter("c"))]).unwrap();
        world.start().unwrap();
        let mut last_seq = None;
        for expected in 1..=5u64 {
            let outcome = world.tick(2.0).unwrap();
            assert_eq!(outcome.tick, expected);
            assert_eq!(world.current_tick(), expected);
            assert_eq!(world.sim_time_hours(), 2.0 * f64::from(u32::try_from(expected).unwrap()));
            for event in outcome.events.iter() {
                assert_eq!(event.tick, expected);
                assert!(last_seq.is_none_or(|seq| event.seq > seq));
                last_seq = Some(event.seq);
            }
        }
    }

    #[test]
    fn faulting_subsystems_do_not_stop_later_ones() {
        let mut world = World::with_subsystems(
            settings(1),
            vec![
                Box::new(Chatter("first")),
                Box::new(Faulty { panics: false }),
                Box::new(Faulty { panics: true }),
                Box::new(Chatter("last")),
            ],
        )
        .unwrap();
        assert!(world.spawn_agent(agent("a1", 0.0, 0.0)));
        world.start().unwrap();

        let outcome = world.tick(1.0).unwrap();
        assert_eq!(outcome.tick, 1);
        assert_eq!(world.current_tick(), 1);
        assert_eq!(outcome.faults.len(), 2);
        assert_eq!(outcome.faults[0].subsystem, "failing");
        assert_eq!(outcome.faults[0].error_class, "invalid_state");
        assert_eq!(outcome.faults[1].subsystem, "panicky");
        assert_eq!(outcome.faults[1].error_class, PANIC_CLASS);
        assert_eq!(outcome.faults[1].message, "boom");

        let sources: Vec<(&str, EventKind)> = outcome
            .events
            .iter()
            .map(|e| (e.subsystem.as_str(), e.kind))
            .collect();
        assert_eq!(
            sources,
            vec![
                (WORLD_SOURCE, EventKind::AgentSpawned),
                ("first", EventKind::ThresholdCrossed),
                ("failing", EventKind::ThresholdCrossed),
                ("failing", EventKind::SubsystemError),
                ("panicky", EventKind::ThresholdCrossed),
                ("panicky", EventKind::SubsystemError),
                ("last", EventKind::ThresholdCrossed),
            ]
        );
        let error_event = &outcome.events[3];
        assert_eq!(error_event.payload.text("subsystem"), Some("failing"));
        assert_eq!(error_event.payload.text("error_class"), Some("invalid_state"));

        // Effects queued before the fault were applied.
        assert!(world.agents().attributes("a1").unwrap().flag("touched"));

        // The next tick still runs everything.
        let again = world.tick(1.0).unwrap();
        assert_eq!(again.tick, 2);
        assert_eq!(again.faults.len(), 2);
    }

    #[test]
    fn agent_effects_are_visible_to_later_subsystems() {
        let mut world = World::with_subsystems(
            settings(1),
            vec![Box::new(Watcher), Box::new(Mover), Box::new(Watcher2)],
        )
        .unwrap();
        assert!(world.spawn_agent(agent("a1", 0.0, 0.0)));
        world.start().unwrap();
        let _ = world.tick(1.0).unwrap();
        assert_eq!(world.signals().number("watcher.longitude"), Some(0.0));
        assert_eq!(world.signals().number("watcher2.longitude"), Some(1.0));
        assert_eq!(world.agents().get("a1").unwrap().position.longitude, 1.0);
        assert_eq!(world.agents().near(Position::new(1.0, 0.0), 0.1), vec!["a1"]);
    }

    /// A second watcher under a different name.
    struct Watcher2;

    impl Subsystem for Watcher2 {
        fn name(&self) -> &'static str {
            "watcher2"
        }
        fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
            let longitude = ctx.agents.get("a1").map_or(-1.0, |a| a.position.longitude);
            ctx.publish("watcher2.longitude", longitude);
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

    #[test]
    fn same_seed_and_steps_give_identical_trajectories() {
        let run = |seed: u64| {
            let mut world = populated(seed);
            let mut events = Vec::new();
            for _ in 0..30 {
                events.extend(world.tick(3.0).unwrap().events.iter().cloned());
            }
            (events, world.snapshot().unwrap())
        };
        let (events_a, snapshot_a) = run(99);
        let (events_b, snapshot_b) = run(99);
        assert!(!events_a.is_empty());
        assert_eq!(events_a, events_b);
        assert_eq!(snapshot_a, snapshot_b);
    }

    #[test]
    fn restored_world_continues_the_same_trajectory() {
        let mut original = populated(5);
        for _ in 0..10 {
            let _ = original.tick(2.0).unwrap();
        }
        let snapshot = original.snapshot().unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: WorldSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let mut resumed = World::standard(settings(0)).unwrap();
        resumed.restore(&decoded).unwrap();
        assert_eq!(resumed.phase(), WorldPhase::Constructed);
        assert_eq!(resumed.seed(), 5);
        assert_eq!(resumed.current_tick(), 10);
        resumed.start().unwrap();

        for _ in 0..10 {
            let expected = original.tick(2.0).unwrap();
            let actual = resumed.tick(2.0).unwrap();
            assert_eq!(expected.events, actual.events);
        }
        let mut left = original.snapshot().unwrap();
        let right = resumed.snapshot().unwrap();
        left.phase = right.phase;
        assert_eq!(left, right);
    }

    #[test]
    fn trade_scenario_through_the_world() {
        let mut world = World::standard(settings(3)).unwrap();
        world.start().unwrap();
        let economy = world.subsystem_mut::<EconomySystem>().unwrap();
        assert!(economy.open_exchange(NewEntity::new("main", "market")));
        let adam: Basket = [("wood".to_owned(), 10.0)].into_iter().collect();
        let eve: Basket = [("stone".to_owned(), 2.0)].into_iter().collect();
        assert!(economy.open_portfolio("adam", &adam));
        assert!(economy.open_portfolio("eve", &eve));
        let give: Basket = [("wood".to_owned(), 5.0)].into_iter().collect();
        let receive: Basket = [("stone".to_owned(), 2.0)].into_iter().collect();
        let receipt = economy
            .execute_trade("main", "adam", "eve", &give, &receive)
            .unwrap();
        assert_eq!(receipt.value_ratio, 0.4);

        let outcome = world.tick(1.0).unwrap();
        let trades: Vec<&Event> = outcome
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Trade)
            .collect();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].subsystem, "economy");
        assert_eq!(trades[0].payload.number("value_ratio"), Some(0.4));
    }

    #[test]
    fn drafts_queued_before_a_snapshot_go_out_after_restore() {
        let mut world = World::standard(settings(3)).unwrap();
        let economy = world.subsystem_mut::<EconomySystem>().unwrap();
        assert!(economy.open_exchange(NewEntity::new("main", "market")));
        assert!(world.spawn_agent(agent("adam", 1.0, 2.0)));
        let snapshot = world.snapshot().unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.subsystems["economy"].pending.len(), 1);

        let mut restored = World::standard(settings(3)).unwrap();
        restored.restore(&snapshot).unwrap();
        restored.start().unwrap();
        let outcome = restored.tick(1.0).unwrap();
        let created: Vec<&Event> = outcome
            .events
            .iter()
            .filter(|e| e.kind == EventKind::EntityCreated && e.entity.as_deref() == Some("main"))
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].subsystem, "economy");
        let spawned: Vec<&Event> = outcome
            .events
            .iter()
            .filter(|e| e.kind == EventKind::AgentSpawned)
            .collect();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].entity.as_deref(), Some("adam"));
        assert_eq!(spawned[0].subsystem, WORLD_SOURCE);

        // Delivered once; a second snapshot carries nothing.
        assert!(restored.snapshot().unwrap().pending.is_empty());
    }

    #[test]
    fn snapshot_rejects_newer_format() {
        let world = World::with_subsystems(settings(1), vec![Box::new(Chatter("c"))]).unwrap();
        let mut snapshot = world.snapshot().unwrap();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let mut other = World::with_subsystems(settings(1), vec![Box::new(Chatter("c"))]).unwrap();
        assert!(matches!(
            other.restore(&snapshot),
            Err(WorldError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn removing_an_agent_emits_on_next_tick() {
        let mut world = World::with_subsystems(settings(1), vec![]).unwrap();
        world.start().unwrap();
        assert!(world.spawn_agent(agent("a1", 0.0, 0.0)));
        assert!(!world.spawn_agent(agent("a1", 5.0, 5.0)));
        let _ = world.tick(1.0).unwrap();
        assert!(world.remove_agent("a1").is_some());
        assert!(world.remove_agent("a1").is_none());
        let outcome = world.tick(1.0).unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].kind, EventKind::AgentRemoved);
        assert_eq!(outcome.events[0].entity.as_deref(), Some("a1"));
        assert_eq!(world.recent_events(10).len(), 2);
    }

    #[test]
    fn calendar_timestamps_follow_simulated_hours() {
        let mut config = SimulationConfig::default();
        config.world.epoch_year = 1200;
        let settings = WorldSettings::from_config(&config).unwrap();
        let epoch = settings.epoch;
        let mut world = World::with_subsystems(settings, vec![Box::new(Chatter("c"))]).unwrap();
        world.start().unwrap();
        let outcome = world.tick(24.0).unwrap();
        assert_eq!(outcome.events[0].timestamp, epoch + chrono::TimeDelta::days(1));
    }
}
