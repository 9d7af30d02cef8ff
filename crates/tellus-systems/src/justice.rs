//! Laws, crimes, and prisons.
//!
//! - Laws drift in `enforcement` and `acceptance`. A proposed law is
//!   enacted once acceptance reaches 0.5; an enacted law is repealed when
//!   acceptance falls below 0.1.
//! - Crimes link the names of the laws they violate. Severity eases toward
//!   the mean enforcement of those laws that still exist; a case goes to
//!   trial at severity 0.5 and closes 24 hours later.
//! - Prisons link their inmates. Security follows occupancy, and
//!   [`JusticeSystem::admit_inmate`] refuses admissions beyond `capacity`.
//!
//! Publishes `justice.enforcement`, the mean enforcement of enacted laws.

use std::any::Any;
use std::collections::BTreeMap;

use tellus_events::EventDraft;
use tellus_types::{EventKind, PropertyMapExt, SubsystemState};
use tellus_world::rng::{blend_weight, chance, ease_toward, jitter, unit};
use tellus_world::{
    CaseStatus, EntityKind, Establishment, LawStatus, NewEntity, Registry, Subsystem,
    SubsystemError, TickContext,
};
use tracing::debug;

use crate::support::{self, Outbox};

/// Signal key for mean enforcement of enacted laws.
pub const ENFORCEMENT_SIGNAL: &str = "justice.enforcement";

/// Acceptance at which a proposed law is enacted.
pub const ENACT_THRESHOLD: f64 = 0.5;
/// Acceptance below which an enacted law is repealed.
pub const REPEAL_THRESHOLD: f64 = 0.1;
/// Severity at which an open case goes to trial.
pub const TRIAL_THRESHOLD: f64 = 0.5;
/// Hours a trial lasts.
pub const TRIAL_HOURS: f64 = 24.0;

/// Prison capacity when none is given.
const DEFAULT_CAPACITY: f64 = 10.0;
/// Fraction of the severity gap closed per hour.
const SEVERITY_RATE: f64 = 0.1;
/// Fraction of the security gap closed per hour.
const SECURITY_RATE: f64 = 0.1;

/// A law.
#[derive(Debug, Clone, PartialEq)]
pub struct Law;

impl EntityKind for Law {
    const KIND: &'static str = "law";
    type Status = LawStatus;
}

/// A reported crime.
#[derive(Debug, Clone, PartialEq)]
pub struct Crime;

impl EntityKind for Crime {
    const KIND: &'static str = "crime";
    type Status = CaseStatus;
}

/// A prison.
#[derive(Debug, Clone, PartialEq)]
pub struct Prison;

impl EntityKind for Prison {
    const KIND: &'static str = "prison";
    type Status = Establishment;
}

/// The justice subsystem.
#[derive(Debug, Default)]
pub struct JusticeSystem {
    laws: Registry<Law>,
    crimes: Registry<Crime>,
    prisons: Registry<Prison>,
    outbox: Outbox,
}

impl JusticeSystem {
    /// Create a justice system with no laws, crimes, or prisons.
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a law. Recognized properties: `enforcement`, `acceptance`.
    pub fn propose_law(&mut self, law: NewEntity) -> bool {
        let created = self.laws.create(law, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Report a crime. Link the names of the violated laws; the
    /// `perpetrator` property names the agent.
    pub fn report_crime(&mut self, crime: NewEntity) -> bool {
        let created = self.crimes.create(crime, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Build a prison. Recognized properties: `capacity`.
    pub fn build_prison(&mut self, prison: NewEntity) -> bool {
        let created = self.prisons.create(prison, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Imprison an agent. Refused for an unknown or defunct prison, a full
    /// prison, or an agent already held there.
    pub fn admit_inmate(&mut self, prison: &str, agent: &str) -> bool {
        let Some(record) = self.prisons.get(prison) else {
            debug!(prison, agent, "Admission to unknown prison refused");
            return false;
        };
        let capacity = record.properties.number_or("capacity", DEFAULT_CAPACITY);
        #[allow(clippy::cast_precision_loss)]
        let full = record.link_count() as f64 >= capacity;
        if record.status() == Establishment::Defunct || full {
            debug!(prison, agent, full, "Admission refused");
            return false;
        }
        let admitted = self.prisons.link(prison, agent, self.outbox.now());
        if admitted {
            self.outbox.push(
                EventDraft::new(EventKind::MemberAdded)
                    .about(prison)
                    .with("kind", Prison::KIND)
                    .with("member", agent),
            );
        }
        admitted
    }

    /// Release an agent.
    pub fn release_inmate(&mut self, prison: &str, agent: &str) -> bool {
        let released = self.prisons.unlink(prison, agent, self.outbox.now());
        if released {
            self.outbox.push(
                EventDraft::new(EventKind::MemberRemoved)
                    .about(prison)
                    .with("kind", Prison::KIND)
                    .with("member", agent),
            );
        }
        released
    }

    /// Read access to the law registry.
    pub const fn laws(&self) -> &Registry<Law> {
        &self.laws
    }

    /// Read access to the crime registry.
    pub const fn crimes(&self) -> &Registry<Crime> {
        &self.crimes
    }

    /// Read access to the prison registry.
    pub const fn prisons(&self) -> &Registry<Prison> {
        &self.prisons
    }
}

impl Subsystem for JusticeSystem {
    fn name(&self) -> &'static str {
        "justice"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let dt = ctx.dt;
        let now = ctx.now_hours;
        let stamp = ctx.evolve_stamp();

        let laws = self.laws.evolve_all(&stamp, |law, rng| {
            let props = &mut law.properties;
            if chance(rng, 0.1, dt) {
                let enforcement = unit(props.number_or("enforcement", 0.5) + jitter(rng, 0.1));
                props.set_number("enforcement", enforcement);
            }
            if chance(rng, 0.05, dt) {
                let acceptance = unit(props.number_or("acceptance", 0.5) + jitter(rng, 0.05));
                props.set_number("acceptance", acceptance);
            }
            let acceptance = props.number_or("acceptance", 0.5);
            match law.status() {
                LawStatus::Proposed if acceptance >= ENACT_THRESHOLD => Some(LawStatus::Enacted),
                LawStatus::Enacted if acceptance < REPEAL_THRESHOLD => Some(LawStatus::Repealed),
                _ => None,
            }
        });
        support::emit_transitions(ctx, Law::KIND, &laws);

        let enforcement: BTreeMap<&str, f64> = self
            .laws
            .iter()
            .map(|law| (law.name.as_str(), law.properties.number_or("enforcement", 0.5)))
            .collect();
        let severity_weight = blend_weight(SEVERITY_RATE, dt);
        let cases = self.crimes.evolve_all(&stamp, |crime, _| {
            let violated: Vec<f64> = crime
                .links
                .iter()
                .filter_map(|law| enforcement.get(law.as_str()).copied())
                .collect();
            let severity = crime.properties.number_or("severity", 0.0);
            let severity = if violated.is_empty() {
                severity
            } else {
                ease_toward(severity, support::mean(violated), severity_weight)
            };
            crime.properties.set_number("severity", severity);
            match crime.status() {
                CaseStatus::Open if severity >= TRIAL_THRESHOLD => {
                    crime.properties.set_number("trial_started_hours", now);
                    Some(CaseStatus::OnTrial)
                }
                CaseStatus::OnTrial
                    if now - crime.properties.number_or("trial_started_hours", now) >= TRIAL_HOURS =>
                {
                    Some(CaseStatus::Closed)
                }
                _ => None,
            }
        });
        support::emit_transitions(ctx, Crime::KIND, &cases);

        let security_weight = blend_weight(SECURITY_RATE, dt);
        let prisons = self.prisons.evolve_all(&stamp, |prison, _| {
            let capacity = prison.properties.number_or("capacity", DEFAULT_CAPACITY).max(1.0);
            #[allow(clippy::cast_precision_loss)]
            let occupancy = unit(prison.link_count() as f64 / capacity);
            let security = ease_toward(
                prison.properties.number_or("security", 0.0),
                occupancy,
                security_weight,
            );
            prison.properties.set_number("security", security);
            (prison.status() == Establishment::Founding && prison.link_count() > 0)
                .then_some(Establishment::Established)
        });
        support::emit_transitions(ctx, Prison::KIND, &prisons);

        let enacted = support::mean(
            self.laws
                .iter()
                .filter(|law| law.status() == LawStatus::Enacted)
                .map(|law| law.properties.number_or("enforcement", 0.5)),
        );
        ctx.publish(ENFORCEMENT_SIGNAL, enacted);
        self.outbox.sync(now);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.laws)?;
        support::save(&mut state, &self.crimes)?;
        support::save(&mut state, &self.prisons)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.laws = support::load(state)?;
        self.crimes = support::load(state)?;
        self.prisons = support::load(state)?;
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use tellus_types::PropertyMap;
    use tellus_world::AgentDirectory;

    use super::*;
    use crate::support::testing::step;

    #[test]
    fn accepted_law_is_enacted_and_crime_goes_to_trial_then_closes() {
        let mut justice = JusticeSystem::new();
        assert!(justice.propose_law(
            NewEntity::new("no_theft", "property")
                .property("enforcement", 0.9)
                .property("acceptance", 0.95)
        ));
        assert!(justice.report_crime(
            NewEntity::new("granary_raid", "theft")
                .property("perpetrator", "cain")
                .link("no_theft")
                .link("repealed_long_ago")
        ));

        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        // Ten-hour ticks: severity closes the whole gap to enforcement.
        let _ = step(&mut justice, &agents, &mut signals, 1, 10.0);
        assert_eq!(justice.laws().get("no_theft").unwrap().status(), LawStatus::Enacted);
        let crime = justice.crimes().get("granary_raid").unwrap();
        assert_eq!(crime.status(), CaseStatus::OnTrial);
        assert!(signals.number(ENFORCEMENT_SIGNAL).unwrap() > 0.7);

        let _ = step(&mut justice, &agents, &mut signals, 2, 10.0);
        assert_eq!(
            justice.crimes().get("granary_raid").unwrap().status(),
            CaseStatus::OnTrial
        );
        let _ = step(&mut justice, &agents, &mut signals, 3, 10.0);
        let _ = step(&mut justice, &agents, &mut signals, 4, 10.0);
        assert_eq!(
            justice.crimes().get("granary_raid").unwrap().status(),
            CaseStatus::Closed
        );
    }

    #[test]
    fn prison_admission_respects_capacity() {
        let mut justice = JusticeSystem::new();
        assert!(justice.build_prison(NewEntity::new("stockade", "jail").property("capacity", 2.0)));
        assert!(justice.admit_inmate("stockade", "cain"));
        assert!(!justice.admit_inmate("stockade", "cain"));
        assert!(justice.admit_inmate("stockade", "abel"));
        assert!(!justice.admit_inmate("stockade", "seth"));
        assert!(!justice.admit_inmate("tower", "seth"));

        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        let _ = step(&mut justice, &agents, &mut signals, 1, 10.0);
        let prison = justice.prisons().get("stockade").unwrap();
        assert_eq!(prison.status(), Establishment::Established);
        assert_eq!(prison.properties.number("security"), Some(1.0));

        assert!(justice.release_inmate("stockade", "cain"));
        assert!(justice.admit_inmate("stockade", "seth"));
    }
}
