//! Configuration loading and typed config structures for the Tellus simulation.
//!
//! The canonical configuration lives in `tellus-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads and validates the file.
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable overriding `persistence.data_dir`.
pub const DATA_DIR_ENV: &str = "TELLUS_DATA_DIR";

/// Environment variable overriding `observer.port`.
pub const OBSERVER_PORT_ENV: &str = "TELLUS_OBSERVER_PORT";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is outside its allowed range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level simulation configuration.
///
/// Mirrors the structure of `tellus-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// World identity, seed, and timing.
    #[serde(default)]
    pub world: WorldConfig,

    /// When the simulation ends.
    #[serde(default)]
    pub simulation: SimulationBoundsConfig,

    /// Tick driver fault handling.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Snapshot and event persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Read-only HTTP/WebSocket observer.
    #[serde(default)]
    pub observer: ObserverConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Initial population and places for a fresh world.
    #[serde(default)]
    pub seed: SeedConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `TELLUS_DATA_DIR` overrides `persistence.data_dir`
    /// - `TELLUS_OBSERVER_PORT` overrides `observer.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, applying environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process
    /// environment).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `TELLUS_OBSERVER_PORT` is not a
    /// port number.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.persistence.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(OBSERVER_PORT_ENV) {
            self.observer.port = port.trim().parse().map_err(|err| ConfigError::Invalid {
                reason: format!("{OBSERVER_PORT_ENV} is not a port number ({port:?}): {err}"),
            })?;
        }
        Ok(())
    }

    /// Check value ranges serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hours = self.world.hours_per_tick;
        if !hours.is_finite() || hours < 0.0 {
            return Err(invalid(format!(
                "world.hours_per_tick must be a non-negative number, got {hours}"
            )));
        }
        if self.persistence.event_retention_ticks == 0 {
            return Err(invalid(
                "persistence.event_retention_ticks must be at least 1".to_owned(),
            ));
        }
        if self.persistence.snapshot_interval_ticks == 0 {
            return Err(invalid(
                "persistence.snapshot_interval_ticks must be at least 1".to_owned(),
            ));
        }
        if self.persistence.max_pending_events == 0 {
            return Err(invalid(
                "persistence.max_pending_events must be at least 1".to_owned(),
            ));
        }
        if self.driver.failure_threshold == 0 {
            return Err(invalid(
                "driver.failure_threshold must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

const fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

/// World-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorldConfig {
    /// Human-readable world name.
    #[serde(default = "default_world_name")]
    pub name: String,

    /// Random seed for reproducibility.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Real-time milliseconds between ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Simulated hours covered by one tick.
    #[serde(default = "default_hours_per_tick")]
    pub hours_per_tick: f64,

    /// Calendar year simulated hour 0 falls on (January 1st, UTC).
    #[serde(default = "default_epoch_year")]
    pub epoch_year: i32,

    /// Per-subsystem update budget in milliseconds before a warning is
    /// logged.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: default_world_name(),
            seed: default_seed(),
            tick_interval_ms: default_tick_interval_ms(),
            hours_per_tick: default_hours_per_tick(),
            epoch_year: default_epoch_year(),
            watchdog_ms: default_watchdog_ms(),
        }
    }
}

/// Simulation boundary configuration.
///
/// A value of 0 for either limit means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SimulationBoundsConfig {
    /// Maximum number of ticks before the simulation ends (0 = unlimited).
    #[serde(default)]
    pub max_ticks: u64,

    /// Maximum wall-clock seconds before the simulation ends (0 = unlimited).
    #[serde(default)]
    pub max_real_time_seconds: u64,
}

/// Tick driver fault handling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriverConfig {
    /// Consecutive faulty ticks before the driver slows down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Minimum interval between ticks while degraded.
    #[serde(default = "default_degraded_interval_ms")]
    pub degraded_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            degraded_interval_ms: default_degraded_interval_ms(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistenceConfig {
    /// Whether snapshots and events are written to disk.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root directory of the file store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Full world snapshot every N ticks.
    #[serde(default = "default_snapshot_interval_ticks")]
    pub snapshot_interval_ticks: u64,

    /// Ticks of events kept in memory once persisted.
    #[serde(default = "default_event_retention_ticks")]
    pub event_retention_ticks: usize,

    /// Interval between retries of failed writes.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Unwritten events held while the store is failing. Past this the
    /// oldest are dropped.
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_data_dir(),
            snapshot_interval_ticks: default_snapshot_interval_ticks(),
            event_retention_ticks: default_event_retention_ticks(),
            retry_interval_ms: default_retry_interval_ms(),
            max_pending_events: default_max_pending_events(),
        }
    }
}

/// Observer server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObserverConfig {
    /// Whether the observer server is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address.
    #[serde(default = "default_observer_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_observer_port")]
    pub port: u16,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_observer_host(),
            port: default_observer_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// What a fresh world starts with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedConfig {
    /// Agents spawned at tick 0.
    #[serde(default = "default_initial_agents")]
    pub initial_agents: u32,

    /// Regions created by the environment subsystem.
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,

    /// Exchanges opened by the economy subsystem.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            initial_agents: default_initial_agents(),
            regions: default_regions(),
            exchanges: default_exchanges(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_world_name() -> String {
    "Tellus".to_owned()
}

const fn default_seed() -> u64 {
    42
}

const fn default_tick_interval_ms() -> u64 {
    1000
}

const fn default_hours_per_tick() -> f64 {
    1.0
}

const fn default_epoch_year() -> i32 {
    1000
}

const fn default_watchdog_ms() -> u64 {
    250
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_degraded_interval_ms() -> u64 {
    5000
}

const fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_snapshot_interval_ticks() -> u64 {
    10
}

const fn default_event_retention_ticks() -> usize {
    100
}

const fn default_retry_interval_ms() -> u64 {
    2000
}

const fn default_max_pending_events() -> usize {
    100_000
}

fn default_observer_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_observer_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_initial_agents() -> u32 {
    12
}

fn default_regions() -> Vec<String> {
    vec![
        "lowlands".to_owned(),
        "highlands".to_owned(),
        "coast".to_owned(),
    ]
}

fn default_exchanges() -> Vec<String> {
    vec!["main".to_owned()]
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    fn parse_without_env(yaml: &str) -> Result<SimulationConfig, ConfigError> {
        let config: SimulationConfig = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.world.seed, 42);
        assert_eq!(config.world.hours_per_tick, 1.0);
        assert_eq!(config.driver.failure_threshold, 3);
        assert_eq!(config.persistence.data_dir, PathBuf::from("data"));
        assert_eq!(config.seed.regions.len(), 3);
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
world:
  name: "Test World"
  seed: 123
  tick_interval_ms: 200
  hours_per_tick: 6.0
  epoch_year: 1200
  watchdog_ms: 50

simulation:
  max_ticks: 500
  max_real_time_seconds: 60

driver:
  failure_threshold: 5
  degraded_interval_ms: 10000

persistence:
  enabled: false
  data_dir: "/var/lib/tellus"
  snapshot_interval_ticks: 25
  event_retention_ticks: 50
  retry_interval_ms: 500

observer:
  enabled: false
  host: "0.0.0.0"
  port: 9090

logging:
  level: "debug"
  json: true

seed:
  initial_agents: 3
  regions: [delta]
  exchanges: [harbor, bazaar]
"#;
        let config = parse_without_env(yaml);
        assert!(config.is_ok(), "Failed to parse: {config:?}");
        let config = config.ok().unwrap_or_default();
        assert_eq!(config.world.name, "Test World");
        assert_eq!(config.world.hours_per_tick, 6.0);
        assert_eq!(config.world.epoch_year, 1200);
        assert_eq!(config.simulation.max_ticks, 500);
        assert_eq!(config.driver.failure_threshold, 5);
        assert!(!config.persistence.enabled);
        assert_eq!(config.persistence.data_dir, PathBuf::from("/var/lib/tellus"));
        assert_eq!(config.observer.port, 9090);
        assert!(config.logging.json);
        assert_eq!(config.seed.exchanges, vec!["harbor", "bazaar"]);
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = parse_without_env("world:\n  seed: 7\n");
        assert!(config.is_ok());
        let config = config.ok().unwrap_or_default();

        // Seed is overridden
        assert_eq!(config.world.seed, 7);
        // Everything else uses defaults
        assert_eq!(config.world.tick_interval_ms, 1000);
        assert_eq!(config.persistence.event_retention_ticks, 100);
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(parse_without_env("").is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            parse_without_env("world:\n  hours_per_tick: -1.0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_without_env("driver:\n  failure_threshold: 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_without_env("persistence:\n  event_retention_ticks: 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parse_without_env("persistence:\n  max_pending_events: 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = SimulationConfig::default();
        let result = config.apply_overrides(|key| match key {
            DATA_DIR_ENV => Some("/tmp/tellus-override".to_owned()),
            OBSERVER_PORT_ENV => Some("7070".to_owned()),
            _ => None,
        });
        assert!(result.is_ok());
        assert_eq!(
            config.persistence.data_dir,
            PathBuf::from("/tmp/tellus-override")
        );
        assert_eq!(config.observer.port, 7070);

        let bad = config.apply_overrides(|key| (key == OBSERVER_PORT_ENV).then(|| "many".to_owned()));
        assert!(matches!(bad, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tellus-config.yaml");
        if path.exists() {
            let config = SimulationConfig::from_file(&path);
            assert!(config.is_ok(), "Failed to load project config: {config:?}");
        }
    }
}
