//! Persistence for the Tellus world simulation.
//!
//! Provides the on-disk record layout and the background task that writes
//! to it without ever blocking the tick loop.
//!
//! # Modules
//!
//! - [`file_store`] -- Atomic JSON records for snapshots, entities, and
//!   events under one data directory.
//! - [`pipeline`] -- [`PersistencePipeline`], an mpsc-fed worker with an
//!   ordered retry queue that advances the durable event watermark.
//! - [`error`] -- [`StoreError`].
//!
//! [`PersistencePipeline`]: pipeline::PersistencePipeline
//! [`StoreError`]: error::StoreError

pub mod error;
pub mod file_store;
pub mod pipeline;

pub use error::StoreError;
pub use file_store::{FileStore, SnapshotWrite, encode_name};
pub use pipeline::{
    DEFAULT_MAX_PENDING_EVENTS, PersistCommand, PersistReport, PersistenceHandle,
    PersistencePipeline, WRITE_BATCH,
};
