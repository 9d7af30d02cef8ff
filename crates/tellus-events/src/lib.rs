//! Event drafting and the in-memory event log for the Tellus simulation.
//!
//! Subsystems emit [`EventDraft`]s during a tick. The world stamps them
//! into immutable [`Event`](tellus_types::Event)s and appends them to the
//! [`EventLog`], which retains recent ticks until the persistence pipeline
//! has drained them.

pub mod draft;
pub mod log;

pub use draft::{EventDraft, EventStamp};
pub use log::{DurableWatermark, EventLog, HARD_CAP_FACTOR};
