//! Domain subsystems for the Tellus world simulation.
//!
//! Each subsystem owns one or more [`Registry`](tellus_world::Registry)s
//! and implements [`Subsystem`]. The world runs them in the order
//! returned by [`standard_subsystems`]; later subsystems read the signals
//! earlier ones publish.
//!
//! # Modules
//!
//! - [`environment`] -- Regional climate random walks and storms
//! - [`economy`] -- Exchanges, portfolios, and atomic barter
//! - [`society`] -- Groups, cohesion, and the structure ladder
//! - [`justice`] -- Laws, crimes, trials, and prisons
//! - [`crisis`] -- Crises, responses, and containment
//! - [`culture`] -- Languages and ideologies
//!
//! # Signals
//!
//! | Key                          | Publisher   | Readers          |
//! |------------------------------|-------------|------------------|
//! | `environment.storm_pressure` | environment | crisis           |
//! | `economy.trade_volume`       | economy     | observers        |
//! | `society.cohesion`           | society     | culture          |
//! | `society.group_count`        | society     | observers        |
//! | `justice.enforcement`        | justice     | observers        |

pub mod crisis;
pub mod culture;
pub mod economy;
pub mod environment;
pub mod justice;
pub mod society;

mod support;

use tellus_world::Subsystem;

pub use crisis::CrisisSystem;
pub use culture::CultureSystem;
pub use economy::{Basket, EconomySystem, TradeReceipt, TradeRejection};
pub use environment::EnvironmentSystem;
pub use justice::JusticeSystem;
pub use society::SocietySystem;

/// Names of the standard subsystems in update order.
pub const STANDARD_ORDER: [&str; 6] = [
    "environment",
    "economy",
    "society",
    "justice",
    "crisis",
    "culture",
];

/// Fresh instances of every standard subsystem, in update order.
pub fn standard_subsystems() -> Vec<Box<dyn Subsystem>> {
    vec![
        Box::new(EnvironmentSystem::new()),
        Box::new(EconomySystem::new()),
        Box::new(SocietySystem::new()),
        Box::new(JusticeSystem::new()),
        Box::new(CrisisSystem::new()),
        Box::new(CultureSystem::new()),
    ]
}
