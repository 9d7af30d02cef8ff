//! The agent directory and its grid spatial index.
//!
//! Agents are owned by the world, not by any subsystem. Subsystems get a
//! shared reference during their update and request changes by queueing
//! [`AgentEffect`]s, which the world applies right after the requesting
//! subsystem returns. That keeps a single mutator for agent state while
//! still letting, say, the environment move people away from a storm.

use std::collections::{BTreeMap, BTreeSet};

use tellus_types::{AgentRecord, PropertyMap, PropertyValue, Position};
use tracing::warn;

/// Width of one spatial index cell, in degrees.
pub const CELL_DEGREES: f64 = 1.0;

/// A deferred change to one agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEffect {
    /// Move the agent.
    Relocate {
        /// Agent id.
        agent: String,
        /// New position.
        position: Position,
    },
    /// Set one attribute.
    SetAttribute {
        /// Agent id.
        agent: String,
        /// Attribute key.
        key: String,
        /// New value.
        value: PropertyValue,
    },
}

impl AgentEffect {
    /// Id of the agent the effect targets.
    pub fn agent(&self) -> &str {
        match self {
            Self::Relocate { agent, .. } | Self::SetAttribute { agent, .. } => agent,
        }
    }
}

type Cell = (i32, i32);

#[allow(clippy::cast_possible_truncation)]
fn cell_of(position: Position) -> Cell {
    // Positions are clamped to +-180, so the floor always fits in i32.
    (
        (position.longitude / CELL_DEGREES).floor() as i32,
        (position.latitude / CELL_DEGREES).floor() as i32,
    )
}

/// Bucketed index of agent ids by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialIndex {
    cells: BTreeMap<Cell, BTreeSet<String>>,
}

impl SpatialIndex {
    fn insert(&mut self, id: &str, position: Position) {
        self.cells
            .entry(cell_of(position))
            .or_default()
            .insert(id.to_owned());
    }

    fn remove(&mut self, id: &str, position: Position) {
        let cell = cell_of(position);
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Candidate ids in every cell the disc may touch.
    #[allow(clippy::cast_possible_truncation)]
    fn candidates(&self, center: Position, radius: f64) -> impl Iterator<Item = &String> {
        let (cx, cy) = cell_of(center);
        let reach = (radius / CELL_DEGREES).ceil().clamp(0.0, 360.0) as i32;
        let (x0, x1) = (cx.saturating_sub(reach), cx.saturating_add(reach));
        let (y0, y1) = (cy.saturating_sub(reach), cy.saturating_add(reach));
        self.cells
            .range((x0, y0)..=(x1, y1))
            .filter(move |((_, y), _)| (y0..=y1).contains(y))
            .flat_map(|(_, bucket)| bucket.iter())
    }
}

/// All agents, keyed by id, with a spatial index kept in sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentDirectory {
    agents: BTreeMap<String, AgentRecord>,
    index: SpatialIndex,
}

impl AgentDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a directory (and its index) from snapshot records.
    pub fn from_records(records: BTreeMap<String, AgentRecord>) -> Self {
        let mut index = SpatialIndex::default();
        for agent in records.values() {
            index.insert(&agent.id, agent.position);
        }
        Self {
            agents: records,
            index,
        }
    }

    /// Add an agent. Returns `false` (and changes nothing) when the id is
    /// already taken.
    pub fn insert(&mut self, agent: AgentRecord) -> bool {
        if self.agents.contains_key(&agent.id) {
            warn!(agent = %agent.id, "Agent already exists, ignoring spawn");
            return false;
        }
        self.index.insert(&agent.id, agent.position);
        self.agents.insert(agent.id.clone(), agent);
        true
    }

    /// Remove an agent.
    pub fn remove(&mut self, id: &str) -> Option<AgentRecord> {
        let agent = self.agents.remove(id)?;
        self.index.remove(id, agent.position);
        Some(agent)
    }

    /// Look up an agent.
    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    /// Whether an id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Agents in id order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Number of agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether there are no agents.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Ids of agents within `radius` degrees of `center`, in id order.
    pub fn near(&self, center: Position, radius: f64) -> Vec<&str> {
        let radius = tellus_types::finite_or_zero(radius).max(0.0);
        let mut hits: Vec<&str> = self
            .index
            .candidates(center, radius)
            .filter(|id| {
                self.agents
                    .get(id.as_str())
                    .is_some_and(|agent| agent.position.distance_to(center) <= radius)
            })
            .map(String::as_str)
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Apply one deferred effect. An effect aimed at a missing agent is
    /// logged and dropped.
    pub fn apply(&mut self, effect: AgentEffect) -> bool {
        let Some(agent) = self.agents.get_mut(effect.agent()) else {
            warn!(agent = effect.agent(), "Effect for unknown agent dropped");
            return false;
        };
        match effect {
            AgentEffect::Relocate { position, .. } => {
                self.index.remove(&agent.id, agent.position);
                agent.position = position;
                self.index.insert(&agent.id, position);
            }
            AgentEffect::SetAttribute { key, value, .. } => {
                agent.attributes.insert(key, value);
            }
        }
        true
    }

    /// Copy of every record for a snapshot.
    pub fn records(&self) -> BTreeMap<String, AgentRecord> {
        self.agents.clone()
    }

    /// Attributes of one agent, if present.
    pub fn attributes(&self, id: &str) -> Option<&PropertyMap> {
        self.agents.get(id).map(|agent| &agent.attributes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn agent(id: &str, longitude: f64, latitude: f64) -> AgentRecord {
        AgentRecord {
            id: id.to_owned(),
            name: id.to_owned(),
            position: Position::new(longitude, latitude),
            attributes: PropertyMap::new(),
            born_at_hours: 0.0,
        }
    }

    #[test]
    fn near_uses_true_distance() {
        let mut directory = AgentDirectory::new();
        assert!(directory.insert(agent("adam", 0.5, 0.5)));
        assert!(directory.insert(agent("eve", 1.5, 0.5)));
        assert!(directory.insert(agent("cain", 5.0, 5.0)));
        assert!(directory.insert(agent("abel", -0.5, -0.5)));
        assert!(!directory.insert(agent("adam", 9.0, 9.0)));

        assert_eq!(directory.near(Position::new(0.5, 0.5), 1.0), vec!["adam", "eve"]);
        assert_eq!(
            directory.near(Position::new(0.0, 0.0), 1.0),
            vec!["abel", "adam"]
        );
        assert!(directory.near(Position::new(50.0, 50.0), 2.0).is_empty());
    }

    #[test]
    fn relocation_updates_the_index() {
        let mut directory = AgentDirectory::new();
        let _ = directory.insert(agent("adam", 0.0, 0.0));
        assert!(directory.apply(AgentEffect::Relocate {
            agent: "adam".to_owned(),
            position: Position::new(20.0, 20.0),
        }));
        assert!(directory.near(Position::new(0.0, 0.0), 1.0).is_empty());
        assert_eq!(directory.near(Position::new(20.0, 20.0), 0.1), vec!["adam"]);

        assert!(!directory.apply(AgentEffect::SetAttribute {
            agent: "ghost".to_owned(),
            key: "mood".to_owned(),
            value: "calm".into(),
        }));
    }

    #[test]
    fn rebuilds_index_from_records() {
        let mut directory = AgentDirectory::new();
        let _ = directory.insert(agent("adam", 3.0, 3.0));
        let rebuilt = AgentDirectory::from_records(directory.records());
        assert_eq!(rebuilt, directory);
        assert_eq!(rebuilt.near(Position::new(3.0, 3.0), 0.5), vec!["adam"]);
        assert!(directory.remove("adam").is_some());
        assert!(directory.near(Position::new(3.0, 3.0), 0.5).is_empty());
    }
}
