//! Entity registries, lifecycles, agents, and the subsystem contract for
//! the Tellus world simulation.
//!
//! Every domain subsystem is assembled from the same parts:
//!
//! - [`registry`] -- [`Registry<K>`], the exclusive owner of one kind of
//!   named entity, with idempotent creation, absent-tolerant references,
//!   order-independent evolution, and JSON (de)serialization.
//! - [`lifecycle`] -- Forward-only status orders for each entity kind.
//! - [`rng`] -- Per-entity random streams derived from the world seed.
//! - [`agents`] -- The world-owned population with a grid spatial index
//!   and deferred [`AgentEffect`]s.
//! - [`subsystem`] -- The [`Subsystem`] trait and its [`TickContext`].
//! - [`error`] -- Registry and subsystem error types.

pub mod agents;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod rng;
pub mod subsystem;

pub use agents::{AgentDirectory, AgentEffect, CELL_DEGREES};
pub use error::{RegistryError, SubsystemError};
pub use lifecycle::{
    CaseStatus, CrisisStatus, Establishment, LawStatus, Lifecycle, ResponseStatus, SocialStructure,
};
pub use registry::{Created, Entity, EntityKind, EvolveStamp, NewEntity, Registry, Transition};
pub use rng::{EntityRng, SeedSource};
pub use subsystem::{Subsystem, TickContext};
