//! The subsystem plugin contract and the per-tick context it runs with.

use std::any::Any;

use tellus_events::EventDraft;
use tellus_types::{PropertyMap, PropertyMapExt, PropertyValue, SubsystemState};

use crate::agents::{AgentDirectory, AgentEffect};
use crate::error::SubsystemError;
use crate::registry::EvolveStamp;
use crate::rng::{EntityRng, SeedSource};

/// A domain module owning registries and one `update` entry point.
///
/// The world calls `update` exactly once per tick, in registration
/// order. An `Err` (or a panic) is converted into a `subsystem_error`
/// event; drafts and effects queued before the fault are kept.
pub trait Subsystem: Send + Any {
    /// Unique name (also the key in snapshots and the `subsystem` field
    /// of events).
    fn name(&self) -> &'static str;

    /// Advance this subsystem by one tick.
    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError>;

    /// Serialize registries, scalar state, and undelivered drafts.
    fn snapshot(&self) -> Result<SubsystemState, SubsystemError>;

    /// Replace all state, undelivered drafts included, with a previously
    /// taken snapshot.
    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError>;

    /// Drafts produced by external mutators between ticks. The world
    /// drains these at the start of the next tick.
    fn take_pending(&mut self) -> Vec<EventDraft> {
        Vec::new()
    }

    /// Upcast for typed read access.
    fn as_any(&self) -> &dyn Any;

    /// Upcast for typed mutable access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Everything a subsystem may touch during `update`.
#[derive(Debug)]
pub struct TickContext<'a> {
    /// Tick being computed (the value the clock will hold afterwards).
    pub tick: u64,
    /// Simulation hours at the end of this tick.
    pub now_hours: f64,
    /// Hours elapsed this tick.
    pub dt: f64,
    /// Root of this world's random streams.
    pub seeds: SeedSource,
    /// Read-only view of the population.
    pub agents: &'a AgentDirectory,
    signals: &'a mut PropertyMap,
    events: Vec<EventDraft>,
    effects: Vec<AgentEffect>,
}

impl<'a> TickContext<'a> {
    /// Build a context for one subsystem update.
    pub const fn new(
        stamp: EvolveStamp,
        agents: &'a AgentDirectory,
        signals: &'a mut PropertyMap,
    ) -> Self {
        Self {
            tick: stamp.tick,
            now_hours: stamp.now_hours,
            dt: stamp.dt,
            seeds: stamp.seeds,
            agents,
            signals,
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Coordinates for [`Registry::evolve_all`](crate::Registry::evolve_all).
    pub const fn evolve_stamp(&self) -> EvolveStamp {
        EvolveStamp {
            seeds: self.seeds,
            tick: self.tick,
            now_hours: self.now_hours,
            dt: self.dt,
        }
    }

    /// A random stream for subsystem-level decisions outside a registry.
    pub fn rng(&self, scope: &str, key: &str) -> EntityRng {
        self.seeds.stream(self.tick, scope, key)
    }

    /// Queue an event draft.
    pub fn emit(&mut self, draft: EventDraft) {
        self.events.push(draft);
    }

    /// Queue several drafts in order.
    pub fn emit_all(&mut self, drafts: impl IntoIterator<Item = EventDraft>) {
        self.events.extend(drafts);
    }

    /// Queue an agent change.
    pub fn queue_effect(&mut self, effect: AgentEffect) {
        self.effects.push(effect);
    }

    /// Read a numeric signal published earlier (this tick or before).
    pub fn signal_number(&self, key: &str) -> Option<f64> {
        self.signals.number(key)
    }

    /// Publish a signal for later readers.
    pub fn publish(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.signals.insert(key.to_owned(), value.into());
    }

    /// Hand back the queued drafts and effects.
    pub fn into_parts(self) -> (Vec<EventDraft>, Vec<AgentEffect>) {
        (self.events, self.effects)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use tellus_types::EventKind;

    use super::*;

    #[test]
    fn context_collects_drafts_effects_and_signals() {
        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        let stamp = EvolveStamp {
            seeds: SeedSource::new(1),
            tick: 4,
            now_hours: 4.0,
            dt: 1.0,
        };
        let mut ctx = TickContext::new(stamp, &agents, &mut signals);
        ctx.emit(EventDraft::new(EventKind::ThresholdCrossed));
        ctx.publish("society.cohesion", 0.5);
        assert_eq!(ctx.signal_number("society.cohesion"), Some(0.5));
        assert_eq!(ctx.evolve_stamp(), stamp);
        ctx.queue_effect(AgentEffect::Relocate {
            agent: "adam".to_owned(),
            position: tellus_types::Position::default(),
        });
        let (events, effects) = ctx.into_parts();
        assert_eq!(events.len(), 1);
        assert_eq!(effects.len(), 1);
        assert_eq!(signals.number("society.cohesion"), Some(0.5));
    }
}
