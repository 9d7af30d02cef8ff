//! Error types for the World Engine binary.
//!
//! [`EngineError`] wraps every failure that can stop the engine at
//! startup or end a run, so `main` can propagate with `?`.

/// Top-level error for the World Engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: tellus_core::ConfigError,
    },

    /// The configured calendar epoch is invalid.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: tellus_core::ClockError,
    },

    /// World construction or restore failed.
    #[error("world error: {source}")]
    World {
        /// The underlying world error.
        #[from]
        source: tellus_core::WorldError,
    },

    /// The tick driver failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: tellus_core::RunnerError,
    },

    /// The data directory or a persisted snapshot is unusable.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: tellus_store::StoreError,
    },

    /// The observer server could not bind.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying server error.
        #[from]
        source: tellus_observer::ServerError,
    },
}
