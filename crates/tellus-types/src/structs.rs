//! Core records exchanged between the simulation, persistence, and the
//! observer: agents, events, and world snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{EventKind, WorldPhase};
use crate::value::PropertyMap;

/// Current on-disk format of [`WorldSnapshot`].
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Category name under which agents are addressed by the query surface
/// and the per-entity record layout.
pub const AGENT_CATEGORY: &str = "agent";

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Position {
    /// Longitude in `[-180, 180]`.
    pub longitude: f64,
    /// Latitude in `[-90, 90]`.
    pub latitude: f64,
}

impl Position {
    /// Build a position, clamping both axes into range. Non-finite input
    /// collapses to `0.0`.
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude: crate::value::finite_or_zero(longitude).clamp(-180.0, 180.0),
            latitude: crate::value::finite_or_zero(latitude).clamp(-90.0, 90.0),
        }
    }

    /// Planar distance in degrees. Good enough for neighbourhood queries
    /// at the scale of a crisis radius.
    pub fn distance_to(self, other: Self) -> f64 {
        (self.longitude - other.longitude).hypot(self.latitude - other.latitude)
    }
}

/// A member of the population.
///
/// Agents are cross-cutting state owned by the world rather than by any
/// one subsystem; subsystems read them and request changes through
/// deferred effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct AgentRecord {
    /// Unique agent identifier (also the key used by portfolios, groups,
    /// and other registries).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current position.
    #[serde(default)]
    pub position: Position,
    /// Open-ended attributes (skills, needs, traits).
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub attributes: PropertyMap,
    /// Simulation hour at which the agent appeared.
    #[serde(default)]
    pub born_at_hours: f64,
}

/// An immutable record of something that happened during a tick.
///
/// Events are stamped by the world when a tick completes and never
/// mutated afterwards. `seq` is a global emission counter, so ordering by
/// `seq` recovers emission order across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Global emission sequence number.
    pub seq: u64,
    /// Tick during which the event was emitted.
    pub tick: u64,
    /// Type tag.
    pub kind: EventKind,
    /// Name of the subsystem that emitted it (`world` for engine events).
    pub subsystem: String,
    /// Name of the entity or agent the event concerns, if any.
    #[serde(default)]
    pub entity: Option<String>,
    /// Simulation time in hours at the end of the tick.
    pub sim_time_hours: f64,
    /// Simulated calendar instant (world epoch plus simulation hours).
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub payload: PropertyMap,
}

/// An event that was queued between ticks but not yet stamped.
///
/// Snapshots carry these so that a restored world emits them with its
/// first tick, exactly as the original world would have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PendingEvent {
    /// Type tag.
    pub kind: EventKind,
    /// Entity or agent the event concerns.
    #[serde(default)]
    pub entity: Option<String>,
    /// Structured payload.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub payload: PropertyMap,
}

/// Serialized state of one subsystem.
///
/// `registries` maps a registry kind (e.g. `crisis`) to a JSON object of
/// `name -> entity`. `state` carries any scalar state the subsystem keeps
/// outside its registries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SubsystemState {
    /// Registry kind to serialized registry.
    #[serde(default)]
    pub registries: BTreeMap<String, serde_json::Value>,
    /// Subsystem-level scalar state.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub state: PropertyMap,
    /// Drafts queued by mutators since the last tick.
    #[serde(default)]
    pub pending: Vec<PendingEvent>,
}

/// A complete, resumable serialization of the world.
///
/// Entity randomness is derived from `(seed, tick, kind, name)`, so the
/// snapshot carries no generator state and still resumes exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct WorldSnapshot {
    /// Layout version of this record.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Human-readable world name.
    #[serde(default)]
    pub world_name: String,
    /// Seed every random stream is derived from.
    pub seed: u64,
    /// Last completed tick.
    pub tick: u64,
    /// Simulation time in hours after that tick.
    pub sim_time_hours: f64,
    /// Simulated calendar instant of the snapshot.
    pub taken_at: DateTime<Utc>,
    /// World lifecycle phase when the snapshot was taken.
    #[serde(default)]
    pub phase: WorldPhase,
    /// Sequence number the next emitted event will receive.
    #[serde(default)]
    pub next_event_seq: u64,
    /// Agents keyed by id.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,
    /// Values published by subsystems for later readers.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub signals: PropertyMap,
    /// Subsystem name to serialized state.
    #[serde(default)]
    pub subsystems: BTreeMap<String, SubsystemState>,
    /// Engine events (agent spawns and removals) queued since the last
    /// tick.
    #[serde(default)]
    pub pending: Vec<PendingEvent>,
}

const fn default_format_version() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

impl WorldSnapshot {
    /// Look up one entity by category and name.
    ///
    /// `agent` addresses the agent directory; any other category is
    /// matched against registry kinds across all subsystems.
    pub fn entity(&self, category: &str, name: &str) -> Option<serde_json::Value> {
        if category == AGENT_CATEGORY {
            return self
                .agents
                .get(name)
                .and_then(|agent| serde_json::to_value(agent).ok());
        }
        self.subsystems
            .values()
            .filter_map(|state| state.registries.get(category))
            .find_map(|registry| registry.get(name).cloned())
    }

    /// Iterate over every registry entity as `(category, name, record)`,
    /// in deterministic order.
    pub fn entity_records(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.subsystems
            .values()
            .flat_map(|state| state.registries.iter())
            .filter_map(|(kind, registry)| registry.as_object().map(|entries| (kind, entries)))
            .flat_map(|(kind, entries)| {
                entries
                    .iter()
                    .map(move |(name, record)| (kind.as_str(), name.as_str(), record))
            })
    }

    /// Number of registry entities plus agents.
    pub fn entity_count(&self) -> usize {
        self.entity_records()
            .count()
            .saturating_add(self.agents.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn sample_snapshot() -> WorldSnapshot {
        let mut crisis = serde_json::Map::new();
        crisis.insert(
            "flood".to_owned(),
            serde_json::json!({"name": "flood", "status": "active"}),
        );
        let mut state = SubsystemState::default();
        state
            .registries
            .insert("crisis".to_owned(), serde_json::Value::Object(crisis));

        let mut snapshot = WorldSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            world_name: "Test".to_owned(),
            seed: 7,
            tick: 3,
            sim_time_hours: 3.0,
            taken_at: DateTime::<Utc>::UNIX_EPOCH,
            phase: WorldPhase::Running,
            next_event_seq: 0,
            agents: BTreeMap::new(),
            signals: PropertyMap::new(),
            subsystems: BTreeMap::new(),
            pending: Vec::new(),
        };
        snapshot.subsystems.insert("crisis".to_owned(), state);
        snapshot.agents.insert(
            "adam".to_owned(),
            AgentRecord {
                id: "adam".to_owned(),
                name: "Adam".to_owned(),
                position: Position::new(10.0, 20.0),
                attributes: PropertyMap::new(),
                born_at_hours: 0.0,
            },
        );
        snapshot
    }

    #[test]
    fn entity_lookup_by_category() {
        let snapshot = sample_snapshot();
        let flood = snapshot.entity("crisis", "flood").unwrap();
        assert_eq!(flood["status"], "active");
        assert!(snapshot.entity("crisis", "drought").is_none());
        assert!(snapshot.entity("response", "flood").is_none());

        let adam = snapshot.entity(AGENT_CATEGORY, "adam").unwrap();
        assert_eq!(adam["name"], "Adam");
        assert_eq!(snapshot.entity_count(), 2);
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let json = serde_json::json!({
            "seed": 1,
            "tick": 4,
            "sim_time_hours": 4.0,
            "taken_at": "1970-01-01T00:00:00Z",
            "added_in_a_later_version": {"anything": true},
        });
        let snapshot: WorldSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(snapshot.tick, 4);
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.phase, WorldPhase::Constructed);
        assert!(snapshot.subsystems.is_empty());
        assert!(snapshot.pending.is_empty());
    }

    #[test]
    fn positions_are_clamped() {
        let p = Position::new(400.0, f64::NAN);
        assert_eq!(p.longitude, 180.0);
        assert_eq!(p.latitude, 0.0);
        assert_eq!(Position::new(0.0, 0.0).distance_to(Position::new(3.0, 4.0)), 5.0);
    }
}
