//! Exchanges, portfolios, and atomic barter.
//!
//! Every agent that trades owns a portfolio named after its agent id. A
//! portfolio keeps `holdings` (resource to amount) and an optional
//! `production` map of per-hour accrual rates. Exchanges keep `prices`
//! (defaulting to 1.0 for unlisted resources) and a decaying traded
//! `volume` per resource; prices relax toward `1 + 0.1 * ln(1 + volume)`.
//!
//! [`EconomySystem::execute_trade`] is all-or-nothing: every check runs
//! before any holding is touched, and a successful trade queues exactly
//! one `trade` event.

use std::any::Any;
use std::collections::BTreeMap;

use tellus_events::EventDraft;
use tellus_types::{EventKind, PropertyMap, PropertyMapExt, PropertyValue, SubsystemState};
use tellus_world::rng::{blend_weight, ease_toward};
use tellus_world::{
    EntityKind, Establishment, NewEntity, Registry, Subsystem, SubsystemError, TickContext,
};

use crate::support::{self, Outbox};

/// Resource name to amount.
pub type Basket = BTreeMap<String, f64>;

/// Signal key for the total traded volume across exchanges.
pub const TRADE_VOLUME_SIGNAL: &str = "economy.trade_volume";

/// Fraction of traded volume forgotten per hour.
const VOLUME_DECAY: f64 = 0.05;
/// Fraction of the gap to the target price closed per hour.
const PRICE_RELAXATION: f64 = 0.1;

/// A market place.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange;

impl EntityKind for Exchange {
    const KIND: &'static str = "exchange";
    type Status = Establishment;
}

/// An agent's holdings, named by agent id.
#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio;

impl EntityKind for Portfolio {
    const KIND: &'static str = "portfolio";
    type Status = Establishment;
}

/// Why a trade was refused. A refused trade changes nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradeRejection {
    /// The exchange does not exist.
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),

    /// The exchange has closed.
    #[error("exchange '{0}' is defunct")]
    ExchangeClosed(String),

    /// One side has no portfolio.
    #[error("no portfolio for '{0}'")]
    UnknownPortfolio(String),

    /// Giver and receiver are the same agent.
    #[error("'{0}' cannot trade with itself")]
    SelfTrade(String),

    /// One side of the trade is empty.
    #[error("both sides of a trade must offer something")]
    EmptySide,

    /// An amount is zero, negative, or not finite.
    #[error("invalid amount {amount} of '{resource}'")]
    InvalidAmount {
        /// Resource name.
        resource: String,
        /// Offending amount.
        amount: f64,
    },

    /// A side does not hold what it offers.
    #[error("'{owner}' holds {held} of '{resource}' but offers {needed}")]
    Insufficient {
        /// Portfolio owner.
        owner: String,
        /// Resource name.
        resource: String,
        /// Amount offered.
        needed: f64,
        /// Amount held.
        held: f64,
    },
}

/// Summary of a completed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeReceipt {
    /// Exchange the trade went through.
    pub exchange: String,
    /// Agent that gave the `give` basket.
    pub giver: String,
    /// Agent that gave the `receive` basket.
    pub receiver: String,
    /// Price-weighted value of what the giver handed over.
    pub given_value: f64,
    /// Price-weighted value of what the giver got back.
    pub received_value: f64,
    /// `received_value / given_value`.
    pub value_ratio: f64,
}

/// The economy subsystem.
#[derive(Debug, Default)]
pub struct EconomySystem {
    exchanges: Registry<Exchange>,
    portfolios: Registry<Portfolio>,
    outbox: Outbox,
}

fn basket_value(basket: &Basket) -> PropertyValue {
    PropertyValue::Map(
        basket
            .iter()
            .map(|(resource, amount)| (resource.clone(), PropertyValue::number(*amount)))
            .collect(),
    )
}

fn price_in(properties: &PropertyMap, resource: &str) -> f64 {
    properties
        .nested("prices")
        .and_then(|prices| prices.number(resource))
        .unwrap_or(1.0)
}

fn validate(basket: &Basket) -> Result<(), TradeRejection> {
    if basket.is_empty() {
        return Err(TradeRejection::EmptySide);
    }
    match basket
        .iter()
        .find(|(_, amount)| !amount.is_finite() || **amount <= 0.0)
    {
        Some((resource, amount)) => Err(TradeRejection::InvalidAmount {
            resource: resource.clone(),
            amount: *amount,
        }),
        None => Ok(()),
    }
}

impl EconomySystem {
    /// Create an economy with no exchanges or portfolios.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an exchange. Initial prices may be given as a `prices` map.
    pub fn open_exchange(&mut self, exchange: NewEntity) -> bool {
        let created = self.exchanges.create(exchange, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Close an exchange for good.
    pub fn close_exchange(&mut self, name: &str) -> bool {
        let transition = self
            .exchanges
            .advance(name, Establishment::Defunct, self.outbox.now());
        let closed = transition.is_some();
        self.outbox
            .push_some(transition.map(|t| t.event(Exchange::KIND)));
        closed
    }

    /// Open a portfolio for `owner` with starting holdings.
    pub fn open_portfolio(&mut self, owner: &str, holdings: &Basket) -> bool {
        let new = NewEntity::new(owner, Portfolio::KIND).property("holdings", basket_value(holdings));
        let created = self.portfolios.create(new, self.outbox.now());
        let is_new = created.is_new;
        let event = created.event();
        self.outbox.push_some(event);
        is_new
    }

    /// Add `amount` of `resource` to a portfolio. Non-positive or
    /// non-finite amounts and unknown owners are ignored.
    pub fn deposit(&mut self, owner: &str, resource: &str, amount: f64) -> bool {
        if !amount.is_finite() || amount <= 0.0 {
            return false;
        }
        self.portfolios
            .update(owner, self.outbox.now(), |portfolio| {
                portfolio
                    .properties
                    .add_nested_number("holdings", resource, amount);
            })
            .is_some()
    }

    /// Amount of `resource` held by `owner` (zero when absent).
    pub fn holding(&self, owner: &str, resource: &str) -> f64 {
        self.portfolios
            .get(owner)
            .map_or(0.0, |portfolio| portfolio.properties.nested_number("holdings", resource))
    }

    /// Current price of `resource` on an exchange.
    pub fn price(&self, exchange: &str, resource: &str) -> Option<f64> {
        self.exchanges
            .get(exchange)
            .map(|exchange| price_in(&exchange.properties, resource))
    }

    /// Read access to the exchange registry.
    pub const fn exchanges(&self) -> &Registry<Exchange> {
        &self.exchanges
    }

    /// Read access to the portfolio registry.
    pub const fn portfolios(&self) -> &Registry<Portfolio> {
        &self.portfolios
    }

    fn check_holdings(&self, owner: &str, basket: &Basket) -> Result<(), TradeRejection> {
        for (resource, needed) in basket {
            let held = self.holding(owner, resource);
            if held < *needed {
                return Err(TradeRejection::Insufficient {
                    owner: owner.to_owned(),
                    resource: resource.clone(),
                    needed: *needed,
                    held,
                });
            }
        }
        Ok(())
    }

    /// Swap `give` (from `giver`) for `receive` (from `receiver`) on
    /// `exchange`.
    ///
    /// Both portfolios and a non-defunct exchange must exist, every amount
    /// must be finite and positive, and each side must hold what it
    /// offers. On success both portfolios change together, the exchange
    /// records the volume, and one `trade` event is queued with
    /// `value_ratio = value(receive) / value(give)` at exchange prices.
    pub fn execute_trade(
        &mut self,
        exchange: &str,
        giver: &str,
        receiver: &str,
        give: &Basket,
        receive: &Basket,
    ) -> Result<TradeReceipt, TradeRejection> {
        let market = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TradeRejection::UnknownExchange(exchange.to_owned()))?;
        if market.status() == Establishment::Defunct {
            return Err(TradeRejection::ExchangeClosed(exchange.to_owned()));
        }
        if giver == receiver {
            return Err(TradeRejection::SelfTrade(giver.to_owned()));
        }
        for owner in [giver, receiver] {
            if !self.portfolios.contains(owner) {
                return Err(TradeRejection::UnknownPortfolio(owner.to_owned()));
            }
        }
        validate(give)?;
        validate(receive)?;
        self.check_holdings(giver, give)?;
        self.check_holdings(receiver, receive)?;

        let value_of = |basket: &Basket| -> f64 {
            basket
                .iter()
                .map(|(resource, amount)| price_in(&market.properties, resource) * amount)
                .sum()
        };
        let given_value = value_of(give);
        let received_value = value_of(receive);
        let value_ratio = if given_value > 0.0 {
            received_value / given_value
        } else {
            0.0
        };

        let now = self.outbox.now();
        let _ = self.portfolios.update(giver, now, |portfolio| {
            for (resource, amount) in give {
                portfolio.properties.add_nested_number("holdings", resource, -amount);
            }
            for (resource, amount) in receive {
                portfolio.properties.add_nested_number("holdings", resource, *amount);
            }
        });
        let _ = self.portfolios.update(receiver, now, |portfolio| {
            for (resource, amount) in receive {
                portfolio.properties.add_nested_number("holdings", resource, -amount);
            }
            for (resource, amount) in give {
                portfolio.properties.add_nested_number("holdings", resource, *amount);
            }
        });
        let _ = self.exchanges.update(exchange, now, |market| {
            for (resource, amount) in give.iter().chain(receive) {
                market.properties.add_nested_number("volume", resource, *amount);
            }
            let count = market.properties.number_or("trade_count", 0.0) + 1.0;
            market.properties.set_number("trade_count", count);
            market.properties.set_number("last_trade_hours", now);
        });

        self.outbox.push(
            EventDraft::new(EventKind::Trade)
                .about(exchange)
                .with("giver", giver)
                .with("receiver", receiver)
                .with("given", basket_value(give))
                .with("received", basket_value(receive))
                .with("value_ratio", value_ratio),
        );
        let established = self
            .exchanges
            .advance(exchange, Establishment::Established, now);
        self.outbox
            .push_some(established.map(|t| t.event(Exchange::KIND)));

        Ok(TradeReceipt {
            exchange: exchange.to_owned(),
            giver: giver.to_owned(),
            receiver: receiver.to_owned(),
            given_value,
            received_value,
            value_ratio,
        })
    }
}

impl Subsystem for EconomySystem {
    fn name(&self) -> &'static str {
        "economy"
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<(), SubsystemError> {
        let dt = ctx.dt;
        let stamp = ctx.evolve_stamp();

        let opened = self.portfolios.evolve_all(&stamp, |portfolio, _| {
            if let Some(production) = portfolio.properties.nested("production").cloned() {
                for (resource, rate) in production.iter().filter_map(|(r, v)| Some((r, v.as_number()?))) {
                    portfolio.properties.with_nested("holdings", |holdings| {
                        let next = (holdings.number_or(resource, 0.0) + rate * dt).max(0.0);
                        holdings.set_number(resource, next);
                    });
                }
            }
            let total: f64 = portfolio
                .properties
                .nested("holdings")
                .map(|holdings| holdings.values().filter_map(PropertyValue::as_number).sum())
                .unwrap_or(0.0);
            (portfolio.status() == Establishment::Founding && total > 0.0)
                .then_some(Establishment::Established)
        });
        support::emit_transitions(ctx, Portfolio::KIND, &opened);

        let decay = 1.0 - blend_weight(VOLUME_DECAY, dt);
        let relax = blend_weight(PRICE_RELAXATION, dt);
        let changed = self.exchanges.evolve_all(&stamp, |exchange, _| {
            let volumes: Vec<(String, f64)> = exchange
                .properties
                .nested("volume")
                .map(|volume| {
                    volume
                        .iter()
                        .filter_map(|(r, v)| Some((r.clone(), v.as_number()?)))
                        .collect()
                })
                .unwrap_or_default();
            for (resource, volume) in volumes {
                let volume = volume * decay;
                let target = 0.1_f64.mul_add(volume.ln_1p(), 1.0);
                let price = ease_toward(price_in(&exchange.properties, &resource), target, relax);
                exchange
                    .properties
                    .with_nested("volume", |map| map.set_number(&resource, volume));
                exchange
                    .properties
                    .with_nested("prices", |map| map.set_number(&resource, price));
            }
            None
        });
        support::emit_transitions(ctx, Exchange::KIND, &changed);

        let total_volume: f64 = self
            .exchanges
            .iter()
            .filter_map(|exchange| exchange.properties.nested("volume"))
            .flat_map(|volume| volume.values().filter_map(PropertyValue::as_number))
            .sum();
        ctx.publish(TRADE_VOLUME_SIGNAL, total_volume);
        self.outbox.sync(ctx.now_hours);
        Ok(())
    }

    fn snapshot(&self) -> Result<SubsystemState, SubsystemError> {
        let mut state = SubsystemState::default();
        support::save(&mut state, &self.exchanges)?;
        support::save(&mut state, &self.portfolios)?;
        self.outbox.save(&mut state);
        Ok(state)
    }

    fn restore(&mut self, state: &SubsystemState) -> Result<(), SubsystemError> {
        self.exchanges = support::load(state)?;
        self.portfolios = support::load(state)?;
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
