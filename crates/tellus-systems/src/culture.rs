//! Languages and ideologies.
//!
//! A language keeps its vocabulary in `words` and links its speakers.
//! Complexity eases toward `min(1, words / 100)` and `drift` accumulates
//! with every hour spoken. A language is established once it has two
//! speakers and five words, and dies out when an established language
//! loses its last speaker.
//!
//! An ideology links its followers. Influence eases toward
//! `min(1, followers / 20) * (0.5 + 0.5 * cohesion)`, where cohesion is the
//! `society.cohesion` signal published earlier in the tick.

use std::any::Any;

use tellus_events::EventDraft;
use tellus_types::{EventKind, PropertyMapExt, PropertyValue, SubsystemState};
use tellus_world::rng::{blend_weight, ease_toward, unit};
use tellus_world::{
    EntityKind, Establishment, NewEntity, Registry, Subsystem, SubsystemError, TickContext,
};

use crate::society::COHESION_SIGNAL;
use crate::support::{self, Outbox};

/// Speakers needed to establish a language.
pub const ESTABLISHED_SPEAKERS: usize = 2;
/// Words needed to establish a language.
pub const ESTABLISHED_WORDS: usize = 5;
/// Followers needed to establish an ideology.
pub const ESTABLISHED_FOLLOWERS: usize = 3;

/// Vocabulary size at which complexity targets 1.0.
const FULL_VOCABULARY: f64 = 100.0;
/// Following at which influence targets its cohesion-scaled maximum.
const FULL_FOLLOWING: f64 = 20.0;
/// Fraction of a gap closed per hour.
const EASE_RATE: f64 = 0.1;
/// Drift accumulated per hour.
const DRIFT_PER_HOUR: f64 = 0.01;

/// A language.
#[derive(Debug, Clone, PartialEq)]
pub struct Language;

impl EntityKind for Language {
    const KIND: &'static str = "language";
    type Status = Establishment;
}

/// An ideology.
#[derive(Debug, Clone, PartialEq)]
pub struct Ideology;

impl EntityKind for Ideology {
    const KIND: &'static str = "ideology";
    type Status = Establishment;
}

/// The culture subsystem.
#[derive(Debug, Default)]
pub struct CultureSystem {
    languages: Registry<Language>,
    ideologies: Registry<Ideology>,
    outbox: Outbox,
}

fn word_count(language: &tellus_world::Entity<Language>) -> usize {
    language
        .properties
        .get("words")
        .and_then(PropertyValue::as_list)
        .map_or(0, <[PropertyValue]>::len)
}

fn establishment(
    status: Establishment,
    qualifies: bool,
    abandoned: bool,
) -> Option<Establishment> {
    match status {
        Establishment::Founding if qualifies => Some(Establishment::Established),
        Establishment::Established if abandoned => Some(Establishment::Defunct),
        _ => None,
    }
}

impl CultureSystem {
    /// Create a culture with no languages or ideologies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a language.
    pub fn create_language(&mut self, language: NewEntity) -> bool {
        let created = self.languages.create(language, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Add a word to a language's vocabulary. Returns `false` for an
    /// unknown language or a word it already has.
    pub fn coin_word(&mut self, language: &str, word: &str) -> bool {
        self.languages
            .update(language, self.outbox.now(), |entity| {
                let mut words: Vec<PropertyValue> = entity
                    .properties
                    .get("words")
                    .and_then(PropertyValue::as_list)
                    .map(<[PropertyValue]>::to_vec)
                    .unwrap_or_default();
                if words.iter().any(|w| w.as_text() == Some(word)) {
                    return false;
                }
                words.push(word.into());
                entity
                    .properties
                    .insert("words".to_owned(), PropertyValue::List(words));
                true
            })
            .unwrap_or(false)
    }

    /// Make an agent a speaker of a language.
    pub fn teach_language(&mut self, language: &str, agent: &str) -> bool {
        let taught = self.languages.link(language, agent, self.outbox.now());
        if taught {
            self.outbox.push(
                EventDraft::new(EventKind::MemberAdded)
                    .about(language)
                    .with("kind", Language::KIND)
                    .with("member", agent),
            );
        }
        taught
    }

    /// Remove a speaker.
    pub fn forget_language(&mut self, language: &str, agent: &str) -> bool {
        let forgotten = self.languages.unlink(language, agent, self.outbox.now());
        if forgotten {
            self.outbox.push(
                EventDraft::new(EventKind::MemberRemoved)
                    .about(language)
                    .with("kind", Language::KIND)
                    .with("member", agent),
            );
        }
        forgotten
    }

    /// Found an ideology.
    pub fn found_ideology(&mut self, ideology: NewEntity) -> bool {
        let created = self.ideologies.create(ideology, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Make an agent a follower of an ideology.
    pub fn adopt_ideology(&mut self, ideology: &str, agent: &str) -> bool {
        let adopted = self.ideologies.link(ideology, agent, self.outbox.now());
        if adopted {
            self.outbox.push(
                EventDraft::new(EventKind::MemberAdded)
                    .about(ideology)
                    .with("kind", Ideology::KIND)
                    .with("member", agent),
            );
        }
        adopted
    }

    /// Read access to the language registry.
    pub const fn languages(&self) -> &Registry<Language> {
        &self.languages
    }

    /// Read access to the ideology registry.
    pub const fn ideologies(&self) -> &Registry<Ideology> {
        &self.ideologies
    }
}

impl Subsystem for CultureSystem {
    fn name(&self) -> &'static str {
        "culture"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let dt = ctx.dt;
        let stamp = ctx.evolve_stamp();
        let weight = blend_weight(EASE_RATE, dt);

        let languages = self.languages.evolve_all(&stamp, |language, _| {
            let words = word_count(language);
            let complexity = ease_toward(
                language.properties.number_or("complexity", 0.0),
                support::saturation(words, FULL_VOCABULARY),
                weight,
            );
            language.properties.set_number("complexity", complexity);
            let drift = DRIFT_PER_HOUR.mul_add(dt, language.properties.number_or("drift", 0.0));
            language.properties.set_number("drift", drift);
            let speakers = language.link_count();
            establishment(
                language.status(),
                speakers >= ESTABLISHED_SPEAKERS && words >= ESTABLISHED_WORDS,
                speakers == 0,
            )
        });
        support::emit_transitions(ctx, Language::KIND, &languages);

        let cohesion = unit(ctx.signal_number(COHESION_SIGNAL).unwrap_or(0.0));
        let ideologies = self.ideologies.evolve_all(&stamp, |ideology, _| {
            let followers = ideology.link_count();
            let target =
                support::saturation(followers, FULL_FOLLOWING) * 0.5f64.mul_add(cohesion, 0.5);
            let influence = ease_toward(
                ideology.properties.number_or("influence", 0.0),
                target,
                weight,
            );
            ideology.properties.set_number("influence", influence);
            establishment(
                ideology.status(),
                followers >= ESTABLISHED_FOLLOWERS,
                followers == 0,
            )
        });
        support::emit_transitions(ctx, Ideology::KIND, &ideologies);

        self.outbox.sync(ctx.now_hours);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.languages)?;
        support::save(&mut state, &self.ideologies)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.languages = support::load(state)?;
        self.ideologies = support::load(state)?;
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
    fn language_is_established_then_dies_out() {
        let mut culture = CultureSystem::new();
        assert!(culture.create_language(NewEntity::new("proto", "spoken")));
        for word in ["sun", "moon", "river", "stone", "fire"] {
            assert!(culture.coin_word("proto", word));
        }
        assert!(!culture.coin_word("proto", "sun"));
        assert!(!culture.coin_word("unknown", "sun"));
        assert!(culture.teach_language("proto", "adam"));
        assert!(culture.teach_language("proto", "eve"));

        let agents = AgentDirectory::new();
        let mut signals = PropertyMap::new();
        let _ = step(&mut culture, &agents, &mut signals, 1, 10.0);
        let proto = culture.languages().get("proto").unwrap();
        assert_eq!(proto.status(), Establishment::Established);
        assert_eq!(proto.properties.number("complexity"), Some(0.05));
        assert!(proto.properties.number("drift").unwrap() > 0.0);

        assert!(culture.forget_language("proto", "adam"));
        assert!(culture.forget_language("proto", "eve"));
        let _ = step(&mut culture, &agents, &mut signals, 2, 10.0);
        assert_eq!(
            culture.languages().get("proto").unwrap().status(),
            Establishment::Defunct
        );
    }

    #[test]
    fn ideology_influence_scales_with_cohesion() {
        let mut low = CultureSystem::new();
        let mut high = CultureSystem::new();
        for culture in [&mut low, &mut high] {
            assert!(culture.found_ideology(NewEntity::new("stewardship", "ethic")));
            for i in 0..20 {
                assert!(culture.adopt_ideology("stewardship", &format!("agent-{i}")));
            }
        }

        let agents = AgentDirectory::new();
        let mut calm = PropertyMap::new();
        calm.set_number(COHESION_SIGNAL, 0.0);
        let mut united = PropertyMap::new();
        united.set_number(COHESION_SIGNAL, 1.0);
        let _ = step(&mut low, &agents, &mut calm, 1, 10.0);
        let _ = step(&mut high, &agents, &mut united, 1, 10.0);

        let influence = |culture: &CultureSystem| {
            culture
                .ideologies()
                .get("stewardship")
                .unwrap()
                .properties
                .number("influence")
                .unwrap()
        };
        assert_eq!(influence(&low), 0.5);
        assert_eq!(influence(&high), 1.0);
        assert_eq!(
            high.ideologies().get("stewardship").unwrap().status(),
            Establishment::Established
        );
    }
}
