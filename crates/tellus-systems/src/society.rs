//! Social groups and their structure ladder.
//!
//! A group links the ids of its member agents. Cohesion eases toward
//! `min(1, members / 10)`, and the group climbs the structure ladder
//! (band, tribe, chiefdom, kingdom, empire, nation) as membership passes
//! each threshold. Groups never descend the ladder.
//!
//! Publishes `society.cohesion` (mean over groups) and
//! `society.group_count`.

use std::any::Any;

use tellus_events::EventDraft;
use tellus_types::{EventKind, PropertyMapExt, SubsystemState};
use tellus_world::rng::{blend_weight, ease_toward};
use tellus_world::{
    EntityKind, Lifecycle, NewEntity, Registry, SocialStructure, Subsystem, SubsystemError, TickContext,
};

use crate::support::{self, Outbox};

/// Signal key for mean group cohesion.
pub const COHESION_SIGNAL: &str = "society.cohesion";

/// Signal key for the number of groups.
pub const GROUP_COUNT_SIGNAL: &str = "society.group_count";

/// Membership needed to reach each rung above band.
pub const STRUCTURE_THRESHOLDS: [(usize, SocialStructure); 5] = [
    (30, SocialStructure::Tribe),
    (100, SocialStructure::Chiefdom),
    (500, SocialStructure::Kingdom),
    (2000, SocialStructure::Empire),
    (10_000, SocialStructure::Nation),
];

/// Membership at which cohesion targets 1.0.
const FULL_COHESION_MEMBERS: f64 = 10.0;
/// Fraction of the cohesion gap closed per hour.
const COHESION_RATE: f64 = 0.1;

/// A social group.
#[derive(Debug, Clone, PartialEq)]
pub struct Group;

impl EntityKind for Group {
    const KIND: &'static str = "group";
    type Status = SocialStructure;
}

/// The highest rung a group of `members` qualifies for.
pub fn structure_for(members: usize) -> SocialStructure {
    STRUCTURE_THRESHOLDS
        .iter()
        .rev()
        .find(|(threshold, _)| members >= *threshold)
        .map_or(SocialStructure::Band, |(_, structure)| *structure)
}

/// The society subsystem.
#[derive(Debug, Default)]
pub struct SocietySystem {
    groups: Registry<Group>,
    outbox: Outbox,
}

impl SocietySystem {
    /// Create a society with no groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Found a group.
    pub fn found_group(&mut self, group: NewEntity) -> bool {
        let created = self.groups.create(group, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Add an agent to a group. Returns `false` for an unknown group or
    /// an existing member.
    pub fn join_group(&mut self, group: &str, agent: &str) -> bool {
        let joined = self.groups.link(group, agent, self.outbox.now());
        if joined {
            self.outbox.push(
                EventDraft::new(EventKind::MemberAdded)
                    .about(group)
                    .with("kind", Group::KIND)
                    .with("member", agent),
            );
        }
        joined
    }

    /// Remove an agent from a group.
    pub fn leave_group(&mut self, group: &str, agent: &str) -> bool {
        let left = self.groups.unlink(group, agent, self.outbox.now());
        if left {
            self.outbox.push(
                EventDraft::new(EventKind::MemberRemoved)
                    .about(group)
                    .with("kind", Group::KIND)
                    .with("member", agent),
            );
        }
        left
    }

    /// Read access to the group registry.
    pub const fn groups(&self) -> &Registry<Group> {
        &self.groups
    }
}

impl Subsystem for SocietySystem {
    fn name(&self) -> &'static str {
        "society"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let weight = blend_weight(COHESION_RATE, ctx.dt);
        let transitions = self.groups.evolve_all(&ctx.evolve_stamp(), |group, _| {
            let members = group.link_count();
            let target = support::saturation(members, FULL_COHESION_MEMBERS);
            let cohesion = ease_toward(group.properties.number_or("cohesion", 0.0), target, weight);
            group.properties.set_number("cohesion", cohesion);
            let rung = structure_for(members);
            (rung.rank() > group.status().rank()).then_some(rung)
        });
        support::emit_transitions(ctx, Group::KIND, &transitions);

        let cohesion = support::mean(
            self.groups
                .iter()
                .map(|group| group.properties.number_or("cohesion", 0.0)),
        );
        ctx.publish(COHESION_SIGNAL, cohesion);
        ctx.publish(
            GROUP_COUNT_SIGNAL,
            u32::try_from(self.groups.len()).unwrap_or(u32::MAX),
        );
        self.outbox.sync(ctx.now_hours);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.groups)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.groups = support::load(state)?;
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
