//! The generic named-entity registry every subsystem builds on.
//!
//! A [`Registry`] exclusively owns the entities of one kind, keyed by a
//! unique name. It replaces the per-domain dictionaries and ad hoc
//! duplicate checks a simulation would otherwise repeat for every entity
//! type. Kinds are zero-sized markers implementing [`EntityKind`], which
//! fixes the registry label and the status lifecycle.
//!
//! # Contract
//!
//! - `create` is idempotent: a second call with an existing name logs a
//!   warning and returns the existing entity untouched.
//! - Reference-style operations (`update`, `link`, `advance`) are
//!   absent-tolerant: a missing name is logged and the call is a no-op.
//! - `evolve_all` applies a rule to every non-terminal entity with an RNG
//!   stream private to that entity, so the outcome does not depend on
//!   iteration order. Status changes proposed by the rule are applied only
//!   when they move forward in the lifecycle.
//! - `serialize` emits `name -> entity` with deterministic key order;
//!   `deserialize` ignores unknown fields and defaults missing ones.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tellus_events::EventDraft;
use tellus_types::{EventKind, PropertyMap, PropertyValue};
use tracing::warn;

use crate::error::RegistryError;
use crate::lifecycle::Lifecycle;
use crate::rng::{EntityRng, SeedSource};

// ---------------------------------------------------------------------------
// Kinds and entities
// ---------------------------------------------------------------------------

/// Marker trait describing one kind of entity.
pub trait EntityKind: Debug + Clone + PartialEq + Send + Sync + 'static {
    /// Registry label (also the query-surface category and the persisted
    /// record directory), e.g. `crisis`.
    const KIND: &'static str;

    /// Lifecycle of this kind.
    type Status: Lifecycle;
}

/// A named record managed by a [`Registry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Entity<K: EntityKind> {
    /// Unique name within the registry.
    pub name: String,
    /// Emergent type tag chosen by the simulation at runtime.
    #[serde(default)]
    pub category: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Lifecycle status. Only the registry moves it; see [`Entity::status`].
    #[serde(default)]
    status: K::Status,
    /// Open-ended properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Names linked to this entity (members, speakers, inmates). These are
    /// weak references and may not resolve.
    #[serde(default)]
    pub links: BTreeSet<String>,
    /// Simulation hour of creation.
    #[serde(default)]
    pub created_at_hours: f64,
    /// Simulation hour of the last mutation.
    #[serde(default)]
    pub updated_at_hours: f64,
}

impl<K: EntityKind> Entity<K> {
    /// Draft the `entity_created` event for this entity.
    pub fn created_event(&self) -> EventDraft {
        EventDraft::new(EventKind::EntityCreated)
            .about(self.name.as_str())
            .with("kind", K::KIND)
            .with("category", self.category.as_str())
    }

    /// Current lifecycle status.
    ///
    /// Rules and update closures get `&mut Entity` but cannot assign this.
    /// It changes only through [`Registry::advance`], the status a rule
    /// returns from [`Registry::evolve_all`], or [`Registry::reset_status`].
    pub const fn status(&self) -> K::Status {
        self.status
    }

    /// Number of linked names.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// Arguments for [`Registry::create`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewEntity {
    /// Unique name.
    pub name: String,
    /// Emergent type tag.
    pub category: String,
    /// Description.
    pub description: String,
    /// Initial properties.
    pub properties: PropertyMap,
    /// Initial links.
    pub links: BTreeSet<String>,
}

impl NewEntity {
    /// Start a new entity with a name and category.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set one initial property.
    #[must_use]
    pub fn property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_owned(), value.into());
        self
    }

    /// Add one initial link.
    #[must_use]
    pub fn link(mut self, name: impl Into<String>) -> Self {
        self.links.insert(name.into());
        self
    }
}

/// Result of [`Registry::create`].
#[derive(Debug)]
pub struct Created<'a, K: EntityKind> {
    /// The new entity, or the one that already held the name.
    pub entity: &'a Entity<K>,
    /// `false` when the name was already taken.
    pub is_new: bool,
}

impl<K: EntityKind> Created<'_, K> {
    /// The `entity_created` event, only for a genuinely new entity.
    pub fn event(&self) -> Option<EventDraft> {
        self.is_new.then(|| self.entity.created_event())
    }
}

/// A forward status move applied by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S> {
    /// Entity name.
    pub name: String,
    /// Status before.
    pub from: S,
    /// Status after.
    pub to: S,
}

impl<S: Lifecycle> Transition<S> {
    /// Draft the `status_changed` event for this move.
    pub fn event(&self, kind: &'static str) -> EventDraft {
        EventDraft::new(EventKind::StatusChanged)
            .about(self.name.as_str())
            .with("kind", kind)
            .with("from", self.from.label())
            .with("to", self.to.label())
    }
}

/// Time and randomness coordinates for one `evolve_all` pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvolveStamp {
    /// World seed source.
    pub seeds: SeedSource,
    /// Tick being computed.
    pub tick: u64,
    /// Simulation hour at the end of the tick.
    pub now_hours: f64,
    /// Hours elapsed this tick.
    pub dt: f64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Exclusive owner of the entities of kind `K`.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry<K: EntityKind> {
    entities: BTreeMap<String, Entity<K>>,
}

impl<K: EntityKind> Default for Registry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityKind> Registry<K> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    /// Registry label.
    pub const fn kind(&self) -> &'static str {
        K::KIND
    }

    /// Create an entity unless the name is taken.
    ///
    /// Never fails: an existing name is logged and the existing entity is
    /// returned unchanged with `is_new = false`.
    pub fn create(&mut self, new: NewEntity, now_hours: f64) -> Created<'_, K> {
        match self.entities.entry(new.name.clone()) {
            Entry::Occupied(slot) => {
                warn!(
                    kind = K::KIND,
                    name = %new.name,
                    "Entity already exists, returning existing record"
                );
                Created {
                    entity: slot.into_mut(),
                    is_new: false,
                }
            }
            Entry::Vacant(slot) => {
                let entity = Entity {
                    name: new.name,
                    category: new.category,
                    description: new.description,
                    status: K::Status::default(),
                    properties: new.properties,
                    links: new.links,
                    created_at_hours: now_hours,
                    updated_at_hours: now_hours,
                };
                Created {
                    entity: slot.insert(entity),
                    is_new: true,
                }
            }
        }
    }

    /// Look up an entity by name.
    pub fn get(&self, name: &str) -> Option<&Entity<K>> {
        self.entities.get(name)
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Mutate one entity in place and stamp its update time.
    ///
    /// Returns `None` (after logging) when the name is unknown.
    pub fn update<R>(
        &mut self,
        name: &str,
        now_hours: f64,
        f: impl FnOnce(&mut Entity<K>) -> R,
    ) -> Option<R> {
        let Some(entity) = self.entities.get_mut(name) else {
            warn!(kind = K::KIND, name, "Reference to unknown entity ignored");
            return None;
        };
        let out = f(entity);
        entity.updated_at_hours = now_hours;
        Some(out)
    }

    /// Delete an entity. Callers are responsible for severing links that
    /// point at it from other registries.
    pub fn remove(&mut self, name: &str) -> Option<Entity<K>> {
        self.entities.remove(name)
    }

    /// Link `member` to entity `name`. Returns `true` when the link is
    /// new; `false` when it already existed or `name` is unknown. Only a
    /// new link stamps the update time.
    pub fn link(&mut self, name: &str, member: &str, now_hours: f64) -> bool {
        self.change_links(name, now_hours, |links| links.insert(member.to_owned()))
    }

    /// Unlink `member` from entity `name`. Returns `true` when a link was
    /// removed, which is also the only case that stamps the update time.
    pub fn unlink(&mut self, name: &str, member: &str, now_hours: f64) -> bool {
        self.change_links(name, now_hours, |links| links.remove(member))
    }

    fn change_links(
        &mut self,
        name: &str,
        now_hours: f64,
        f: impl FnOnce(&mut BTreeSet<String>) -> bool,
    ) -> bool {
        let Some(entity) = self.entities.get_mut(name) else {
            warn!(kind = K::KIND, name, "Reference to unknown entity ignored");
            return false;
        };
        let changed = f(&mut entity.links);
        if changed {
            entity.updated_at_hours = now_hours;
        }
        changed
    }

    /// Apply an externally requested forward status move.
    ///
    /// Backward or sideways requests are rejected with a warning.
    pub fn advance(
        &mut self,
        name: &str,
        to: K::Status,
        now_hours: f64,
    ) -> Option<Transition<K::Status>> {
        let entity = self.entities.get_mut(name);
        let Some(entity) = entity else {
            warn!(kind = K::KIND, name, "Status change for unknown entity ignored");
            return None;
        };
        let transition = apply_transition(entity, to);
        if transition.is_some() {
            entity.updated_at_hours = now_hours;
        }
        transition
    }

    /// Force a status, bypassing the forward-only rule.
    ///
    /// This is the explicit reset path for operators and restore tooling.
    /// Subsystem updates never call it.
    pub fn reset_status(&mut self, name: &str, status: K::Status, now_hours: f64) -> bool {
        self.update(name, now_hours, |entity| {
            warn!(
                kind = K::KIND,
                name = %entity.name,
                from = entity.status.label(),
                to = status.label(),
                "Status reset"
            );
            entity.status = status;
        })
        .is_some()
    }

    /// Apply `rule` to every non-terminal entity.
    ///
    /// The rule receives the entity and an RNG stream derived from
    /// `(seed, tick, kind, name)`. It may mutate properties and links and
    /// may propose a new status, which is applied only when it is a
    /// forward move. Returns the applied transitions in name order.
    pub fn evolve_all<F>(&mut self, stamp: &EvolveStamp, rule: F) -> Vec<Transition<K::Status>>
    where
        F: Fn(&mut Entity<K>, &mut EntityRng) -> Option<K::Status>,
    {
        let mut transitions = Vec::new();
        for entity in self.entities.values_mut() {
            if entity.status.is_terminal() {
                continue;
            }
            let mut rng = stamp.seeds.stream(stamp.tick, K::KIND, &entity.name);
            let proposed = rule(entity, &mut rng);
            entity.updated_at_hours = stamp.now_hours;
            if let Some(next) = proposed
                && let Some(transition) = apply_transition(entity, next)
            {
                transitions.push(transition);
            }
        }
        transitions
    }

    /// Iterate over entities in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity<K>> {
        self.entities.values()
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Serialize as a JSON object of `name -> entity`.
    pub fn serialize(&self) -> Result<serde_json::Value, RegistryError> {
        serde_json::to_value(&self.entities)
            .map_err(|source| RegistryError::Serialization { kind: K::KIND, source })
    }

    /// Rebuild a registry from [`serialize`](Self::serialize) output.
    ///
    /// `null` yields an empty registry. Unknown fields are ignored.
    pub fn deserialize(value: &serde_json::Value) -> Result<Self, RegistryError> {
        if value.is_null() {
            return Ok(Self::new());
        }
        let entities: BTreeMap<String, Entity<K>> = serde_json::from_value(value.clone())
            .map_err(|source| RegistryError::Serialization { kind: K::KIND, source })?;
        if let Some((key, entity)) = entities.iter().find(|(key, entity)| **key != entity.name) {
            return Err(RegistryError::NameMismatch {
                kind: K::KIND,
                key: key.clone(),
                name: entity.name.clone(),
            });
        }
        Ok(Self { entities })
    }
}

fn apply_transition<K: EntityKind>(
    entity: &mut Entity<K>,
    next: K::Status,
) -> Option<Transition<K::Status>> {
    let current = entity.status;
    if current == next {
        return None;
    }
    if !current.can_advance_to(next) {
        warn!(
            kind = K::KIND,
            name = %entity.name,
            from = current.label(),
            to = next.label(),
            "Rejected non-forward status change"
        );
        return None;
    }
    entity.status = next;
    Some(Transition {
        name: entity.name.clone(),
        from: current,
        to: next,
    })
}
