//! World orchestration, simulation clock, and tick driver for Tellus.
//!
//! # Modules
//!
//! - [`clock`] -- Tick counter, simulated hours, and the calendar epoch.
//! - [`config`] -- Configuration loading from `tellus-config.yaml` into
//!   strongly-typed structs.
//! - [`world`] -- [`World`], the single owner of simulation state, and its
//!   fault-isolating [`World::tick`].
//! - [`operator`] -- Shared pause/stop/speed control and driver progress.
//! - [`runner`] -- [`run_simulation`], the async loop around `World::tick`.
//!
//! [`World`]: world::World
//! [`World::tick`]: world::World::tick
//! [`run_simulation`]: runner::run_simulation

pub mod clock;
pub mod config;
pub mod operator;
pub mod runner;
pub mod world;

pub use clock::{ClockError, SimClock};
pub use config::{ConfigError, SimulationConfig};
pub use operator::{OperatorState, SimulationEndReason, SimulationStatus};
pub use runner::{
    DriverSettings, NoOpCallback, RunnerError, SimulationResult, TickCallback, TickFrame,
    run_simulation,
};
pub use world::{SubsystemFault, TickOutcome, World, WorldError, WorldSettings};
