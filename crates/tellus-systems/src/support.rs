//! Plumbing shared by the concrete subsystems.

use tellus_events::EventDraft;
use tellus_types::{PendingEvent, PropertyMapExt, SubsystemState};
use tellus_world::{EntityKind, Lifecycle, Registry, RegistryError, TickContext, Transition};

/// Key under which each subsystem stores the hour of its last update.
pub(crate) const CLOCK_KEY: &str = "clock_hours";

/// Drafts produced by mutators called between ticks, plus the time those
/// mutators stamp entities with.
#[derive(Debug, Clone, Default)]
pub(crate) struct Outbox {
    hours: f64,
    drafts: Vec<EventDraft>,
}

impl Outbox {
    /// Simulation hour of the last completed update.
    pub(crate) const fn now(&self) -> f64 {
        self.hours
    }

    pub(crate) const fn sync(&mut self, hours: f64) {
        self.hours = hours;
    }

    pub(crate) fn push(&mut self, draft: EventDraft) {
        self.drafts.push(draft);
    }

    pub(crate) fn push_some(&mut self, draft: Option<EventDraft>) {
        if let Some(draft) = draft {
            self.drafts.push(draft);
        }
    }

    pub(crate) fn take(&mut self) -> Vec<EventDraft> {
        std::mem::take(&mut self.drafts)
    }

    /// Write the clock and any undelivered drafts.
    pub(crate) fn save(&self, state: &mut SubsystemState) {
        state.state.set_number(CLOCK_KEY, self.hours);
        state.pending = self.drafts.iter().cloned().map(PendingEvent::from).collect();
    }

    /// Reset from a snapshot. Drafts queued here before the call are
    /// replaced by the ones the snapshot carries.
    pub(crate) fn load(&mut self, state: &SubsystemState) {
        self.hours = state.state.number_or(CLOCK_KEY, 0.0);
        self.drafts = state.pending.iter().cloned().map(EventDraft::from).collect();
    }
}

/// Store a registry under its kind.
pub(crate) fn save<K: EntityKind>(
    state: &mut SubsystemState,
    registry: &Registry<K>,
) -> Result<(), RegistryError> {
    state
        .registries
        .insert(K::KIND.to_owned(), registry.serialize()?);
    Ok(())
}

/// Load a registry by kind; a missing entry is an empty registry.
pub(crate) fn load<K: EntityKind>(state: &SubsystemState) -> Result<Registry<K>, RegistryError> {
    state
        .registries
        .get(K::KIND)
        .map_or_else(|| Ok(Registry::new()), Registry::deserialize)
}

pub(crate) fn emit_transitions<S: Lifecycle>(
    ctx: &mut TickContext<'_>,
    kind: &'static str,
    transitions: &[Transition<S>],
) {
    ctx.emit_all(transitions.iter().map(|t| t.event(kind)));
}

/// Arithmetic mean, `0.0` for an empty input.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0_usize), |(sum, count), v| (sum + v, count.saturating_add(1)));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// `part / whole`, `0.0` when `whole` is zero.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn fraction(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// `min(1, count / full)`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn saturation(count: usize, full: f64) -> f64 {
    tellus_world::rng::unit(count as f64 / full)
}


#[cfg(test)]
pub(crate) mod testing {
    //! Drive a single subsystem the way the world does.

    use tellus_events::EventDraft;
    use tellus_types::PropertyMap;
    use tellus_world::{AgentDirectory, AgentEffect, EvolveStamp, SeedSource, Subsystem, TickContext};

    /// Run one update at `tick` (ending at `tick * dt` hours). Returns the
    /// pending drafts followed by the update's drafts, and the effects.
    pub(crate) fn step(
        subsystem: &mut dyn Subsystem,
        agents: &AgentDirectory,
        signals: &mut PropertyMap,
        tick: u64,
        dt: f64,
    ) -> (Vec<EventDraft>, Vec<AgentEffect>) {
        let mut drafts = subsystem.take_pending();
        #[allow(clippy::cast_precision_loss)]
        let stamp = EvolveStamp {
            seeds: SeedSource::new(7),
            tick,
            now_hours: tick as f64 * dt,
            dt,
        };
        let mut ctx = TickContext::new(stamp, agents, signals);
        let result = subsystem.update(&mut ctx);
        assert!(result.is_ok(), "update failed: {result:?}");
        let (events, effects) = ctx.into_parts();
        drafts.extend(events);
        (drafts, effects)
    }
}
