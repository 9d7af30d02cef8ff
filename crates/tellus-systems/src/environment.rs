//! Regional climate.
//!
//! Each region random-walks its temperature and precipitation. A region is
//! stormy while precipitation exceeds [`STORM_THRESHOLD`]; storm onset and
//! end are reported as `threshold_crossed` events, and agents inside the
//! region are told to shelter through a deferred attribute change.
//!
//! Publishes `environment.storm_pressure`, the fraction of stormy regions.

use std::any::Any;
use std::collections::BTreeMap;

use tellus_events::EventDraft;
use tellus_types::{EventKind, Position, PropertyMapExt, SubsystemState};
use tellus_world::rng::{jitter, unit};
use tellus_world::{
    AgentEffect, Entity, EntityKind, Establishment, NewEntity, Registry, Subsystem,
    SubsystemError, TickContext,
};

use crate::support::{self, Outbox};

/// Precipitation above which a region is stormy.
pub const STORM_THRESHOLD: f64 = 0.8;

/// Temperature bound in degrees Celsius (applied symmetrically).
pub const TEMPERATURE_LIMIT: f64 = 50.0;

/// Signal key for the fraction of stormy regions.
pub const STORM_PRESSURE_SIGNAL: &str = "environment.storm_pressure";

/// Agent attribute set while the agent's region is stormy.
pub const SHELTERING_ATTRIBUTE: &str = "sheltering";

/// Temperature walk amplitude per hour.
const TEMPERATURE_STEP: f64 = 0.5;
/// Precipitation walk amplitude per hour.
const PRECIPITATION_STEP: f64 = 0.05;
/// Region radius in degrees when none is given.
const DEFAULT_RADIUS: f64 = 5.0;

/// A climate region.
#[derive(Debug, Clone, PartialEq)]
pub struct Region;

impl EntityKind for Region {
    const KIND: &'static str = "region";
    type Status = Establishment;
}

/// The environment subsystem.
#[derive(Debug, Default)]
pub struct EnvironmentSystem {
    regions: Registry<Region>,
    outbox: Outbox,
}

impl EnvironmentSystem {
    /// Create an environment with no regions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region. Recognized properties: `temperature`,
    /// `precipitation`, `longitude`, `latitude`, `radius`.
    pub fn create_region(&mut self, region: NewEntity) -> bool {
        let created = self.regions.create(region, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Read access to the region registry.
    pub const fn regions(&self) -> &Registry<Region> {
        &self.regions
    }
}

fn center(region: &Entity<Region>) -> Position {
    Position::new(
        region.properties.number_or("longitude", 0.0),
        region.properties.number_or("latitude", 0.0),
    )
}

impl Subsystem for EnvironmentSystem {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let dt = ctx.dt;
        let before: BTreeMap<String, bool> = self
            .regions
            .iter()
            .map(|region| (region.name.clone(), region.properties.flag("storm")))
            .collect();

        let transitions = self.regions.evolve_all(&ctx.evolve_stamp(), |region, rng| {
            let props = &mut region.properties;
            let temperature = props.number_or("temperature", 15.0) + jitter(rng, TEMPERATURE_STEP * dt);
            props.set_number(
                "temperature",
                temperature.clamp(-TEMPERATURE_LIMIT, TEMPERATURE_LIMIT),
            );
            let precipitation =
                unit(props.number_or("precipitation", 0.3) + jitter(rng, PRECIPITATION_STEP * dt));
            props.set_number("precipitation", precipitation);
            props.set_flag("storm", precipitation > STORM_THRESHOLD);
            (region.status() == Establishment::Founding).then_some(Establishment::Established)
        });
        support::emit_transitions(ctx, Region::KIND, &transitions);

        let mut stormy = 0_usize;
        for region in self.regions.iter() {
            let storm = region.properties.flag("storm");
            if storm {
                stormy = stormy.saturating_add(1);
            }
            if before.get(&region.name).copied().unwrap_or(false) == storm {
                continue;
            }
            ctx.emit(
                EventDraft::new(EventKind::ThresholdCrossed)
                    .about(region.name.as_str())
                    .with("threshold", "storm")
                    .with("state", if storm { "onset" } else { "end" })
                    .with("precipitation", region.properties.number_or("precipitation", 0.0)),
            );
            let radius = region.properties.number_or("radius", DEFAULT_RADIUS);
            let affected: Vec<String> = ctx
                .agents
                .near(center(region), radius)
                .into_iter()
                .map(str::to_owned)
                .collect();
            for agent in affected {
                ctx.queue_effect(AgentEffect::SetAttribute {
                    agent,
                    key: SHELTERING_ATTRIBUTE.to_owned(),
                    value: storm.into(),
                });
            }
        }

        ctx.publish(
            STORM_PRESSURE_SIGNAL,
            support::fraction(stormy, self.regions.len()),
        );
        self.outbox.sync(ctx.now_hours);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.regions)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.regions = support::load(state)?;
        self.outbox.load(state);
        Ok(())
    }

    fn take_pending(&mut self) -> Vec<EventDraft> {
        self.outbox.take()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use tellus_types::{AgentRecord, PropertyMap};
    use tellus_world::AgentDirectory;

    use super::*;
    use crate::support::testing::step;

    #[test]
    fn storm_onset_emits_event_and_shelters_agents() {
        let mut env = EnvironmentSystem::new();
        assert!(env.create_region(
            NewEntity::new("lowlands", "plain")
                .property("precipitation", 0.99)
                .property("longitude", 0.0)
                .property("latitude", 0.0)
                .property("radius", 2.0)
        ));
        assert!(!env.create_region(NewEntity::new("lowlands", "plain")));

        let mut agents = AgentDirectory::new();
        let _ = agents.insert(AgentRecord {
            id: "adam".to_owned(),
            name: "Adam".to_owned(),
            position: Position::new(1.0, 1.0),
            attributes: PropertyMap::new(),
            born_at_hours: 0.0,
        });
        let mut signals = PropertyMap::new();

        // Precipitation 0.99 stays above 0.8 after a 0.05 step.
        let (drafts, effects) = step(&mut env, &agents, &mut signals, 1, 1.0);
        let kinds: Vec<EventKind> = drafts.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::EntityCreated,
                EventKind::StatusChanged,
                EventKind::ThresholdCrossed
            ]
        );
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].agent(), "adam");
        assert_eq!(signals.number(STORM_PRESSURE_SIGNAL), Some(1.0));
    }

    #[test]
    fn values_stay_clamped_over_long_steps() {
        let mut env = EnvironmentSystem::new();
        let _ = env.create_region(NewEntity::new("peak", "mountain").property("temperature", 49.0));
        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        for tick in 1..=50 {
            let _ = step(&mut env, &agents, &mut signals, tick, 100.0);
            let peak = env.regions().get("peak").unwrap();
            let t = peak.properties.number("temperature").unwrap();
            let p = peak.properties.number("precipitation").unwrap();
            assert!((-TEMPERATURE_LIMIT..=TEMPERATURE_LIMIT).contains(&t));
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut env = EnvironmentSystem::new();
        let _ = env.create_region(NewEntity::new("coast", "shore"));
        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        let _ = step(&mut env, &agents, &mut signals, 1, 1.0);

        let state = env.snapshot().unwrap();
        let mut restored = EnvironmentSystem::new();
        restored.restore(&state).unwrap();
        assert_eq!(restored.regions(), env.regions());
        assert_eq!(restored.snapshot().unwrap(), state);
    }
}
