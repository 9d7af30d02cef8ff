//! Shared type definitions for the Tellus world simulation.
//!
//! This crate is the vocabulary every other crate speaks: property values,
//! agents, events, and world snapshots. Observer-facing types derive
//! `ts-rs` bindings for dashboard clients.
//!
//! # Modules
//!
//! - [`value`] -- Schema-free property maps with a closed set of value kinds
//! - [`enums`] -- Event type tags and the world lifecycle phase
//! - [`structs`] -- Agents, events, and snapshots

pub mod enums;
pub mod structs;
pub mod value;

// Re-export all public types at crate root for convenience.
pub use enums::{EventKind, WorldPhase};
pub use structs::{
    AGENT_CATEGORY, AgentRecord, Event, PendingEvent, Position, SNAPSHOT_FORMAT_VERSION,
    SubsystemState, WorldSnapshot,
};
pub use value::{PropertyMap, PropertyMapExt, PropertyValue, finite_or_zero};
