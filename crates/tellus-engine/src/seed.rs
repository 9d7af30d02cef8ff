//! Initial population and places for a fresh world.
//!
//! Seeding runs once, before the first tick, and only when no snapshot was
//! found. Every random draw comes from the world seed, so two engines with
//! the same config build the same starting world.

use rand::Rng;
use tellus_core::World;
use tellus_core::config::SeedConfig;
use tellus_systems::economy::Basket;
use tellus_systems::{CultureSystem, EconomySystem, EnvironmentSystem};
use tellus_types::{AgentRecord, Position, PropertyMap, PropertyMapExt};
use tellus_world::NewEntity;
use tellus_world::SeedSource;
use tellus_world::rng::jitter;
use tracing::{debug, info};

/// Language every seed agent speaks.
pub const COMMON_LANGUAGE: &str = "common";

/// Regions are placed within this many degrees of the origin.
const REGION_SPREAD_DEGREES: f64 = 20.0;

/// Agents start within this many degrees of their home region.
const AGENT_SCATTER_DEGREES: f64 = 1.5;

/// Starting goods as `(resource, minimum, spread)`.
const STARTING_GOODS: &[(&str, f64, f64)] = &[
    ("wood", 5.0, 10.0),
    ("stone", 2.0, 6.0),
    ("grain", 10.0, 20.0),
];

/// Agent names, reused with a generation suffix once exhausted.
const NAME_POOL: &[&str] = &[
    "Ada", "Bram", "Cora", "Dov", "Edda", "Finn", "Greta", "Hale", "Ines", "Jory", "Kaia", "Lev",
    "Mira", "Nils", "Orla", "Piet", "Runa", "Sven", "Tova", "Ulf", "Vera", "Wim", "Yara", "Zev",
];

/// What seeding created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Regions created.
    pub regions: usize,
    /// Exchanges opened.
    pub exchanges: usize,
    /// Agents spawned.
    pub agents: usize,
}

/// Populate a constructed world from the `seed` config section.
///
/// Creation is idempotent: seeding an already seeded world adds nothing.
pub fn seed_world(world: &mut World, config: &SeedConfig) -> SeedReport {
    let seeds = SeedSource::new(world.seed());
    let mut report = SeedReport::default();

    let centers: Vec<Position> = config
        .regions
        .iter()
        .map(|name| {
            let mut rng = seeds.stream(0, "seed.region", name);
            Position::new(
                jitter(&mut rng, REGION_SPREAD_DEGREES),
                jitter(&mut rng, REGION_SPREAD_DEGREES),
            )
        })
        .collect();

    if let Some(environment) = world.subsystem_mut::<EnvironmentSystem>() {
        for (name, center) in config.regions.iter().zip(&centers) {
            let region = NewEntity::new(name.as_str(), "wilderness")
                .property("longitude", center.longitude)
                .property("latitude", center.latitude);
            if environment.create_region(region) {
                report.regions = report.regions.saturating_add(1);
            }
        }
    }

    if let Some(economy) = world.subsystem_mut::<EconomySystem>() {
        for name in &config.exchanges {
            if economy.open_exchange(NewEntity::new(name.as_str(), "market")) {
                report.exchanges = report.exchanges.saturating_add(1);
            }
        }
    }

    let mut spawned = Vec::new();
    for index in 0..config.initial_agents {
        let id = format!("agent-{index:03}");
        let mut rng = seeds.stream(0, "seed.agent", &id);
        let home = usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_rem(centers.len()))
            .and_then(|i| centers.get(i))
            .copied()
            .unwrap_or_default();
        let mut attributes = PropertyMap::new();
        attributes.set_number("industry", rng.random::<f64>());
        attributes.set_number("sociability", rng.random::<f64>());
        let agent = AgentRecord {
            id: id.clone(),
            name: agent_name(index),
            position: Position::new(
                home.longitude + jitter(&mut rng, AGENT_SCATTER_DEGREES),
                home.latitude + jitter(&mut rng, AGENT_SCATTER_DEGREES),
            ),
            attributes,
            born_at_hours: 0.0,
        };
        if world.spawn_agent(agent) {
            report.agents = report.agents.saturating_add(1);
            spawned.push(id);
        }
    }

    if let Some(economy) = world.subsystem_mut::<EconomySystem>() {
        for id in &spawned {
            let mut rng = seeds.stream(0, "seed.goods", id);
            let goods: Basket = STARTING_GOODS
                .iter()
                .map(|(resource, minimum, spread)| {
                    let amount = rng.random::<f64>().mul_add(*spread, *minimum).floor();
                    ((*resource).to_owned(), amount)
                })
                .collect();
            economy.open_portfolio(id, &goods);
        }
    }

    if !spawned.is_empty()
        && let Some(culture) = world.subsystem_mut::<CultureSystem>()
    {
        culture.create_language(NewEntity::new(COMMON_LANGUAGE, "spoken"));
        for id in &spawned {
            culture.teach_language(COMMON_LANGUAGE, id);
        }
        debug!(speakers = spawned.len(), "Common language seeded");
    }

    info!(
        regions = report.regions,
        exchanges = report.exchanges,
        agents = report.agents,
        "World seeded"
    );
    report
}

fn agent_name(index: u32) -> String {
    let Ok(index) = usize::try_from(index) else {
        return format!("Agent {index}");
    };
    let base = index
        .checked_rem(NAME_POOL.len())
        .and_then(|i| NAME_POOL.get(i))
        .copied()
        .unwrap_or("Agent");
    match index.checked_div(NAME_POOL.len()).unwrap_or(0) {
        0 => base.to_owned(),
        generation => format!("{base} {}", generation.saturating_add(1)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use tellus_core::WorldSettings;

    use super::*;

    fn config() -> SeedConfig {
        SeedConfig {
            initial_agents: 30,
            regions: vec!["lowlands".to_owned(), "coast".to_owned()],
            exchanges: vec!["main".to_owned()],
        }
    }

    fn seeded(seed: u64) -> World {
        let mut world = World::standard(WorldSettings::new("seeded", seed)).unwrap();
        seed_world(&mut world, &config());
        world
    }

    #[test]
    fn seeding_creates_configured_world() {
        let mut world = World::standard(WorldSettings::new("seeded", 5)).unwrap();
        let report = seed_world(&mut world, &config());
        assert_eq!(
            report,
            SeedReport {
                regions: 2,
                exchanges: 1,
                agents: 30,
            }
        );
        assert_eq!(world.agents().len(), 30);

        let economy = world.subsystem::<EconomySystem>().unwrap();
        let wood = economy.holding("agent-000", "wood");
        assert!((5.0..=15.0).contains(&wood));
        assert_eq!(wood, wood.floor());
    }

    #[test]
    fn seeding_twice_adds_nothing() {
        let mut world = seeded(5);
        let again = seed_world(&mut world, &config());
        assert_eq!(again, SeedReport::default());
        assert_eq!(world.agents().len(), 30);
    }

    #[test]
    fn same_seed_same_starting_world() {
        let a = seeded(11).snapshot().unwrap();
        let b = seeded(11).snapshot().unwrap();
        let c = seeded(12).snapshot().unwrap();
        assert_eq!(a, b);
        assert_ne!(a.agents, c.agents);
    }

    #[test]
    fn names_cycle_with_generation_suffix() {
        assert_eq!(agent_name(0), "Ada");
        assert_eq!(agent_name(23), "Zev");
        assert_eq!(agent_name(24), "Ada 2");
        assert_eq!(agent_name(49), "Bram 3");
    }

    #[test]
    fn seeded_world_ticks() {
        let mut world = seeded(3);
        world.start().unwrap();
        let outcome = world.tick(1.0).unwrap();
        assert!(outcome.is_clean());
        assert!(outcome.events.len() >= 30);
    }
}
