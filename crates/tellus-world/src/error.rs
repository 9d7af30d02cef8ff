//! Error types for registries and subsystems.
//!
//! Most registry operations fail soft (log and no-op) and never return an
//! error. These types cover the paths that genuinely can fail:
//! (de)serialization and internally inconsistent state.

/// Errors raised while (de)serializing a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry could not be converted to or from JSON.
    #[error("{kind} registry serialization failed: {source}")]
    Serialization {
        /// Registry kind.
        kind: &'static str,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// A serialized entity is stored under a key different from its name.
    #[error("{kind} registry entry '{key}' holds entity named '{name}'")]
    NameMismatch {
        /// Registry kind.
        kind: &'static str,
        /// Key the record was stored under.
        key: String,
        /// Name inside the record.
        name: String,
    },
}

/// Errors a subsystem may return from `update`, `snapshot`, or `restore`.
///
/// The orchestrator converts an update error into a `subsystem_error`
/// event carrying [`SubsystemError::class`].
#[derive(Debug, thiserror::Error)]
pub enum SubsystemError {
    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Subsystem state is internally inconsistent.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Subsystem-level state could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SubsystemError {
    /// Short error class recorded in `subsystem_error` events.
    pub const fn class(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) => "serialization",
        }
    }
}
