//! Unstamped events as produced by subsystems.
//!
//! A subsystem only knows *what* happened. The world knows *when*: it
//! stamps every draft with the tick, the simulation time, the simulated
//! calendar instant, and a global sequence number once the tick's
//! subsystem updates have all run.

use chrono::{DateTime, Utc};
use tellus_types::{Event, EventKind, PendingEvent, PropertyMap, PropertyValue};

/// An event that has not yet been assigned a sequence number or time.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    /// Type tag.
    pub kind: EventKind,
    /// Entity or agent the event concerns.
    pub entity: Option<String>,
    /// Structured payload.
    pub payload: PropertyMap,
}

impl EventDraft {
    /// Start a draft of the given kind with an empty payload.
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            entity: None,
            payload: PropertyMap::new(),
        }
    }

    /// Name the entity the event concerns.
    #[must_use]
    pub fn about(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Add a payload field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

impl From<EventDraft> for PendingEvent {
    fn from(draft: EventDraft) -> Self {
        Self {
            kind: draft.kind,
            entity: draft.entity,
            payload: draft.payload,
        }
    }
}

impl From<PendingEvent> for EventDraft {
    fn from(pending: PendingEvent) -> Self {
        Self {
            kind: pending.kind,
            entity: pending.entity,
            payload: pending.payload,
        }
    }
}

/// Time coordinates applied to every event of one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventStamp {
    /// The tick the events belong to.
    pub tick: u64,
    /// Simulation hours at the end of that tick.
    pub sim_time_hours: f64,
    /// Simulated calendar instant at the end of that tick.
    pub timestamp: DateTime<Utc>,
}

impl EventStamp {
    /// Turn a draft into an immutable [`Event`].
    pub fn apply(&self, seq: u64, subsystem: &str, draft: EventDraft) -> Event {
        Event {
            seq,
            tick: self.tick,
            kind: draft.kind,
            subsystem: subsystem.to_owned(),
            entity: draft.entity,
            sim_time_hours: self.sim_time_hours,
            timestamp: self.timestamp,
            payload: draft.payload,
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use tellus_types::PropertyMapExt;

    #[test]
    fn stamping_copies_draft_fields() {
        let draft = EventDraft::new(EventKind::Trade)
            .about("main")
            .with("value_ratio", 0.4);
        let stamp = EventStamp {
            tick: 9,
            sim_time_hours: 9.0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        };
        let event = stamp.apply(41, "economy", draft);
        assert_eq!(event.seq, 41);
        assert_eq!(event.tick, 9);
        assert_eq!(event.subsystem, "economy");
        assert_eq!(event.entity.as_deref(), Some("main"));
        assert_eq!(event.payload.number("value_ratio"), Some(0.4));
    }
}
