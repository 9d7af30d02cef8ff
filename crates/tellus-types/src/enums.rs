//! Enumeration types shared across the workspace.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The type tag of an [`Event`](crate::Event).
///
/// The set is closed at the engine level; domain detail travels in the
/// event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EventKind {
    /// An agent joined the world.
    AgentSpawned,
    /// An agent left the world.
    AgentRemoved,
    /// A registry created a new entity.
    EntityCreated,
    /// A registry removed an entity.
    EntityRemoved,
    /// An entity moved forward through its lifecycle.
    StatusChanged,
    /// A name was linked to an entity (group member, speaker, inmate).
    MemberAdded,
    /// A name was unlinked from an entity.
    MemberRemoved,
    /// Goods changed hands on an exchange.
    Trade,
    /// A tracked quantity crossed a documented threshold.
    ThresholdCrossed,
    /// A subsystem failed during its update and was skipped for the rest
    /// of the tick.
    SubsystemError,
}

impl EventKind {
    /// Stable `snake_case` label, matching the serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentSpawned => "agent_spawned",
            Self::AgentRemoved => "agent_removed",
            Self::EntityCreated => "entity_created",
            Self::EntityRemoved => "entity_removed",
            Self::StatusChanged => "status_changed",
            Self::MemberAdded => "member_added",
            Self::MemberRemoved => "member_removed",
            Self::Trade => "trade",
            Self::ThresholdCrossed => "threshold_crossed",
            Self::SubsystemError => "subsystem_error",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of the world itself.
///
/// `Constructed -> Running -> Stopped`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum WorldPhase {
    /// Built but not yet ticking.
    #[default]
    Constructed,
    /// Accepting ticks.
    Running,
    /// Halted; no further ticks are accepted.
    Stopped,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_label_matches_serde() {
        for kind in [
            EventKind::AgentSpawned,
            EventKind::EntityCreated,
            EventKind::StatusChanged,
            EventKind::Trade,
            EventKind::SubsystemError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
