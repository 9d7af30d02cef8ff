//! Crises and the responses organized against them.
//!
//! # Responses
//!
//! A response names its target in the `crisis` property and links its
//! participants. It activates once it has a participant, and its
//! `effectiveness` eases toward `min(1, participants / 10)`. An active
//! response completes above 0.8 and may fail (0.1 per hour) below 0.2.
//!
//! # Crises
//!
//! A crisis sits at `longitude`/`latitude` and affects every agent within
//! `radius` degrees; affected agents accumulate in its links. Each hour
//! severity may rise (chance 0.1) by
//! `(0.6 * agent_factor + 0.4 * resource_factor + 0.2 * storm) * 0.1`,
//! and it always falls by `mitigation * 0.1 * dt`, where mitigation is the
//! best effectiveness among active or completed responses.
//!
//! The status ladder is walked one rung per tick:
//!
//! | From      | To        | When                                         |
//! |-----------|-----------|----------------------------------------------|
//! | active    | contained | mitigation >= 0.8 or severity < 0.2          |
//! | contained | resolved  | severity < 0.2, chance 0.05 per hour         |
//!
//! Responses are evolved before crises so a crisis sees this tick's
//! effectiveness.

use std::any::Any;
use std::collections::BTreeMap;

use tellus_events::EventDraft;
use tellus_types::{EventKind, Position, PropertyMapExt, SubsystemState};
use tellus_world::rng::{blend_weight, chance, ease_toward, unit};
use tellus_world::{
    CrisisStatus, EntityKind, NewEntity, Registry, ResponseStatus, Subsystem, SubsystemError,
    TickContext,
};

use crate::environment::STORM_PRESSURE_SIGNAL;
use crate::support::{self, Outbox};

/// Mitigation at which an active crisis is contained.
pub const CONTAINMENT_MITIGATION: f64 = 0.8;
/// Severity below which a crisis may be contained or resolved.
pub const CALM_SEVERITY: f64 = 0.2;
/// Effectiveness above which a response completes.
pub const COMPLETION_EFFECTIVENESS: f64 = 0.8;
/// Effectiveness below which a response may fail.
pub const FAILURE_EFFECTIVENESS: f64 = 0.2;

/// Per-hour chance that severity rises.
const ESCALATION_CHANCE: f64 = 0.1;
/// Per-hour chance that a calm, contained crisis resolves.
const RESOLUTION_CHANCE: f64 = 0.05;
/// Per-hour chance that an ineffective response fails.
const FAILURE_CHANCE: f64 = 0.1;
/// Participants at which effectiveness targets 1.0.
const FULL_RESPONSE: f64 = 10.0;
/// Affected agents at which the agent factor reaches 1.0.
const FULL_AGENT_IMPACT: f64 = 100.0;
/// Fraction of the effectiveness gap closed per hour.
const EFFECTIVENESS_RATE: f64 = 0.1;
/// Crisis radius in degrees when none is given.
const DEFAULT_RADIUS: f64 = 1.0;

/// A crisis.
#[derive(Debug, Clone, PartialEq)]
pub struct Crisis;

impl EntityKind for Crisis {
    const KIND: &'static str = "crisis";
    type Status = CrisisStatus;
}

/// A response to a crisis.
#[derive(Debug, Clone, PartialEq)]
pub struct Response;

impl EntityKind for Response {
    const KIND: &'static str = "response";
    type Status = ResponseStatus;
}

/// The crisis subsystem.
#[derive(Debug, Default)]
pub struct CrisisSystem {
    crises: Registry<Crisis>,
    responses: Registry<Response>,
    outbox: Outbox,
}

impl CrisisSystem {
    /// Create a crisis subsystem with nothing going on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a crisis. Recognized properties: `severity`, `longitude`,
    /// `latitude`, `radius`, `resource_factor`.
    pub fn declare_crisis(&mut self, crisis: NewEntity) -> bool {
        let created = self.crises.create(crisis, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Plan a response. The `crisis` property names its target.
    pub fn plan_response(&mut self, response: NewEntity) -> bool {
        let created = self.responses.create(response, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Add a participant to a response.
    pub fn join_response(&mut self, response: &str, agent: &str) -> bool {
        let joined = self.responses.link(response, agent, self.outbox.now());
        if joined {
            self.outbox.push(
                EventDraft::new(EventKind::MemberAdded)
                    .about(response)
                    .with("kind", Response::KIND)
                    .with("member", agent),
            );
        }
        joined
    }

    /// Override a response's effectiveness (clamped to `[0, 1]`).
    pub fn set_response_effectiveness(&mut self, response: &str, effectiveness: f64) -> bool {
        self.responses
            .update(response, self.outbox.now(), |r| {
                r.properties.set_number("effectiveness", unit(effectiveness));
            })
            .is_some()
    }

    /// Read access to the crisis registry.
    pub const fn crises(&self) -> &Registry<Crisis> {
        &self.crises
    }

    /// Read access to the response registry.
    pub const fn responses(&self) -> &Registry<Response> {
        &self.responses
    }

    /// Best effectiveness among working responses, per crisis.
    fn mitigation(&self) -> BTreeMap<String, f64> {
        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        for response in self.responses.iter().filter(|r| {
            matches!(r.status(), ResponseStatus::Active | ResponseStatus::Completed)
        }) {
            let Some(target) = response.properties.text("crisis") else {
                continue;
            };
            let effectiveness = response.properties.number_or("effectiveness", 0.0);
            let slot = best.entry(target.to_owned()).or_insert(0.0);
            *slot = slot.max(effectiveness);
        }
        best
    }
}

impl Subsystem for CrisisSystem {
    fn name(&self) -> &'static str {
        "crisis"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let dt = ctx.dt;
        let stamp = ctx.evolve_stamp();

        let weight = blend_weight(EFFECTIVENESS_RATE, dt);
        let responses = self.responses.evolve_all(&stamp, |response, rng| {
            let participants = response.link_count();
            if response.status() == ResponseStatus::Planned {
                return (participants > 0).then_some(ResponseStatus::Active);
            }
            let target = support::saturation(participants, FULL_RESPONSE);
            let effectiveness = ease_toward(
                response.properties.number_or("effectiveness", 0.0),
                target,
                weight,
            );
            response.properties.set_number("effectiveness", effectiveness);
            if effectiveness > COMPLETION_EFFECTIVENESS {
                Some(ResponseStatus::Completed)
            } else if effectiveness < FAILURE_EFFECTIVENESS && chance(rng, FAILURE_CHANCE, dt) {
                Some(ResponseStatus::Failed)
            } else {
                None
            }
        });
        support::emit_transitions(ctx, Response::KIND, &responses);

        let mitigation = self.mitigation();
        let affected: BTreeMap<String, Vec<String>> = self
            .crises
            .iter()
            .filter(|crisis| crisis.status() != CrisisStatus::Resolved)
            .map(|crisis| {
                let center = Position::new(
                    crisis.properties.number_or("longitude", 0.0),
                    crisis.properties.number_or("latitude", 0.0),
                );
                let radius = crisis.properties.number_or("radius", DEFAULT_RADIUS);
                let near: Vec<String> = ctx
                    .agents
                    .near(center, radius)
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                (crisis.name.clone(), near)
            })
            .collect();
        let storm = unit(ctx.signal_number(STORM_PRESSURE_SIGNAL).unwrap_or(0.0));

        let crises = self.crises.evolve_all(&stamp, |crisis, rng| {
            if let Some(near) = affected.get(&crisis.name) {
                crisis.links.extend(near.iter().cloned());
            }
            let agent_factor = support::saturation(crisis.link_count(), FULL_AGENT_IMPACT);
            let resource_factor = unit(crisis.properties.number_or("resource_factor", 0.0));
            let mitigated = mitigation.get(&crisis.name).copied().unwrap_or(0.0);

            let mut severity = crisis.properties.number_or("severity", 0.5);
            if chance(rng, ESCALATION_CHANCE, dt) {
                let pressure = 0.6f64.mul_add(
                    agent_factor,
                    0.4f64.mul_add(resource_factor, 0.2 * storm),
                );
                severity += pressure * 0.1;
            }
            severity = unit((mitigated * 0.1).mul_add(-dt, severity));
            crisis.properties.set_number("severity", severity);
            crisis.properties.set_number("mitigation", mitigated);

            match crisis.status() {
                CrisisStatus::Active
                    if mitigated >= CONTAINMENT_MITIGATION || severity < CALM_SEVERITY =>
                {
                    Some(CrisisStatus::Contained)
                }
                CrisisStatus::Contained
                    if severity < CALM_SEVERITY && chance(rng, RESOLUTION_CHANCE, dt) =>
                {
                    Some(CrisisStatus::Resolved)
                }
                _ => None,
            }
        });
        support::emit_transitions(ctx, Crisis::KIND, &crises);

        self.outbox.sync(ctx.now_hours);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.crises)?;
        support::save(&mut state, &self.responses)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.crises = support::load(state)?;
        self.responses = support::load(state)?;
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
