//! World Engine binary for the Tellus simulation.
//!
//! Wires the world, the tick driver, persistence, and the observer
//! together, runs until a bound or an operator stop is reached, and writes
//! a final snapshot on the way out.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `tellus-config.yaml` (or the path given as
//!    the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Open the file store and load the last snapshot, if any
//! 4. Build the world: restore the snapshot or seed a fresh world
//! 5. Start the persistence pipeline
//! 6. Bind the observer API server
//! 7. Run the simulation loop
//! 8. Write the final snapshot, drain persistence, stop the observer

mod error;
mod publish;
mod seed;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tellus_core::config::LoggingConfig;
use tellus_core::runner::log_simulation_end;
use tellus_core::{
    DriverSettings, OperatorState, SimulationConfig, World, WorldSettings, run_simulation,
};
use tellus_events::DurableWatermark;
use tellus_observer::{AppState, ServerConfig};
use tellus_store::{FileStore, PersistencePipeline};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::publish::PublishCallback;

/// Default configuration file, relative to the working directory.
const CONFIG_FILE: &str = "tellus-config.yaml";

/// Application entry point for the World Engine.
///
/// # Errors
///
/// Returns an error if startup fails (bad config, unusable data
/// directory, unreadable snapshot, observer bind failure) or the tick
/// driver fails.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), EngineError> {
    // 1. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_path)?;

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!(
        config = %config_path.display(),
        world_name = config.world.name,
        seed = config.world.seed,
        tick_interval_ms = config.world.tick_interval_ms,
        hours_per_tick = config.world.hours_per_tick,
        "tellus-engine starting"
    );

    // 3. Open the store and look for a snapshot to resume from.
    let store = if config.persistence.enabled {
        Some(FileStore::open(&config.persistence.data_dir)?)
    } else {
        info!("Persistence disabled");
        None
    };
    let resume = match &store {
        Some(store) => store.load_snapshot()?,
        None => None,
    };

    // 4. Build the world.
    let settings = WorldSettings::from_config(&config)?;
    let mut world = World::standard(settings)?;
    if let Some(snapshot) = resume {
        world.restore(&snapshot)?;
        info!(
            tick = snapshot.tick,
            sim_time_hours = snapshot.sim_time_hours,
            agents = snapshot.agents.len(),
            "Resumed from snapshot"
        );
    } else {
        seed::seed_world(&mut world, &config.seed);
    }

    // 5. Start persistence. The log only evicts what the pipeline wrote.
    let watermark = DurableWatermark::starting_at(world.event_log().next_seq());
    let mut world = if store.is_some() {
        world.with_watermark(watermark.clone())
    } else {
        world
    };
    let pipeline = store.map(|store| {
        PersistencePipeline::spawn_with_backlog(
            store,
            watermark,
            Duration::from_millis(config.persistence.retry_interval_ms),
            config.persistence.max_pending_events,
        )
    });

    // 6. Operator control and the observer.
    let operator = Arc::new(OperatorState::new(
        config.world.tick_interval_ms,
        &config.simulation,
    ));
    spawn_ctrl_c_handler(Arc::clone(&operator));

    let observer_shutdown = Arc::new(Notify::new());
    let (app_state, observer_task) = if config.observer.enabled {
        let state = Arc::new(AppState::with_operator(Arc::clone(&operator)));
        let listener = tellus_observer::bind(&ServerConfig::from_config(&config.observer)).await?;
        let shutdown = Arc::clone(&observer_shutdown);
        let task = tokio::spawn(tellus_observer::serve(
            listener,
            Arc::clone(&state),
            async move { shutdown.notified().await },
        ));
        (Some(state), Some(task))
    } else {
        info!("Observer disabled");
        (None, None)
    };

    let mut callback = PublishCallback::new(config.persistence.snapshot_interval_ticks);
    if let Some(pipeline) = &pipeline {
        callback = callback.with_persistence(pipeline.handle());
    }
    if let Some(state) = &app_state {
        callback = callback.with_observer(Arc::clone(state));
    }

    // 7. Run.
    info!(
        max_ticks = operator.max_ticks(),
        max_real_time_seconds = operator.max_real_time_seconds(),
        agents = world.agents().len(),
        "Entering tick loop"
    );
    let driver = DriverSettings::from_config(&config);
    let outcome = run_simulation(&mut world, &operator, &driver, &mut callback).await;
    if let Ok(result) = &outcome {
        log_simulation_end(result);
    }

    // 8. Final snapshot and drain, even when the driver failed.
    if let Some(pipeline) = pipeline {
        match world.snapshot() {
            Ok(snapshot) => {
                if let Err(err) = pipeline.handle().persist_snapshot(Arc::new(snapshot)) {
                    error!(error = %err, "Could not enqueue final snapshot");
                }
            }
            Err(err) => error!(error = %err, "Could not take final snapshot"),
        }
        match pipeline.shutdown().await {
            Ok(report) if report.is_clean() => {
                info!(watermark = report.watermark, "Final snapshot written");
            }
            Ok(report) => warn!(
                pending_events = report.pending_events,
                pending_snapshot = report.pending_snapshot,
                dropped_events = report.dropped_events,
                "Persistence stopped with unwritten records"
            ),
            Err(err) => error!(error = %err, "Persistence pipeline failed"),
        }
    }

    observer_shutdown.notify_one();
    if let Some(task) = observer_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "Observer server failed"),
            Err(err) => error!(error = %err, "Observer task panicked"),
        }
    }

    let result = outcome?;
    info!(
        end_reason = ?result.end_reason,
        total_ticks = result.total_ticks,
        final_tick = result.final_tick,
        "tellus-engine shutdown complete"
    );
    Ok(())
}

/// Load configuration from `path`, or defaults (with environment
/// overrides) when the file does not exist.
fn load_config(path: &Path) -> Result<SimulationConfig, EngineError> {
    if path.exists() {
        return Ok(SimulationConfig::from_file(path)?);
    }
    let mut config = SimulationConfig::default();
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn spawn_ctrl_c_handler(operator: Arc<OperatorState>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping after the current tick");
                operator.request_stop();
            }
            Err(err) => warn!(error = %err, "Could not listen for Ctrl-C"),
        }
    });
}
