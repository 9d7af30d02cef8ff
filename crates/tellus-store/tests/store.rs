//! Integration tests for the `tellus-store` file layout and pipeline.
//!
//! Every test works in its own directory under the system temp dir and
//! removes it afterwards.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::arithmetic_side_effects
)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tellus_core::{World, WorldSettings};
use tellus_events::DurableWatermark;
use tellus_store::{FileStore, PersistencePipeline, StoreError, WRITE_BATCH};
use tellus_systems::EnvironmentSystem;
use tellus_types::{AgentRecord, Event, Position, PropertyMap, WorldSnapshot};
use tellus_world::NewEntity;
use uuid::Uuid;

struct Scratch(PathBuf);

impl Scratch {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("tellus-store-{}", Uuid::new_v4())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn agent(id: &str) -> AgentRecord {
    AgentRecord {
        id: id.to_owned(),
        name: id.to_uppercase(),
        position: Position::new(4.0, 51.0),
        attributes: PropertyMap::new(),
        born_at_hours: 0.0,
    }
}

/// A running world with one region and two agents, ticked twice.
fn ticked_world() -> (World, Vec<Event>) {
    let mut world = World::standard(WorldSettings::new("store-test", 7)).unwrap();
    assert!(world.spawn_agent(agent("a1")));
    assert!(world.spawn_agent(agent("a/2")));
    let environment = world.subsystem_mut::<EnvironmentSystem>().unwrap();
    assert!(environment.create_region(
        NewEntity::new("lowlands", "plain")
            .property("longitude", 4.0)
            .property("latitude", 51.0)
    ));
    world.start().unwrap();
    let mut events = Vec::new();
    for _ in 0..2 {
        let outcome = world.tick(1.0).unwrap();
        events.extend(outcome.events.iter().cloned());
    }
    (world, events)
}

fn snapshot_of(world: &World) -> WorldSnapshot {
    world.snapshot().unwrap()
}

// =========================================================================
// FileStore
// =========================================================================

#[test]
fn missing_snapshot_means_fresh_world() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    assert!(store.load_snapshot().unwrap().is_none());
    assert!(store.recent_events(10).unwrap().is_empty());
}

#[test]
fn snapshot_round_trips_with_entity_records() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (world, _) = ticked_world();
    let snapshot = snapshot_of(&world);

    let written = store.save_snapshot(&snapshot).unwrap();
    assert_eq!(written.agents, 2);
    assert_eq!(written.entities, snapshot.entity_records().count());
    assert_eq!(written.pruned, 0);

    let loaded = store.load_snapshot().unwrap().unwrap();
    assert_eq!(loaded, snapshot);

    let region = store.load_entity("region", "lowlands").unwrap().unwrap();
    assert_eq!(Some(region), snapshot.entity("region", "lowlands"));
    assert!(store.entity_path("agent", "a1").exists());
    assert!(store.entity_path("agent", "a/2").exists());
    assert!(
        store
            .entity_path("agent", "a/2")
            .starts_with(scratch.path().join("entities").join("agent"))
    );
}

#[test]
fn resaving_prunes_removed_entities() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (mut world, _) = ticked_world();
    store.save_snapshot(&snapshot_of(&world)).unwrap();

    assert!(world.remove_agent("a1").is_some());
    world.tick(1.0).unwrap();
    let written = store.save_snapshot(&snapshot_of(&world)).unwrap();

    assert_eq!(written.agents, 1);
    assert_eq!(written.pruned, 1);
    assert!(!store.entity_path("agent", "a1").exists());
    assert!(store.load_entity("agent", "a1").unwrap().is_none());
}

#[test]
fn corrupt_snapshot_is_an_error_not_a_fresh_world() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    std::fs::create_dir_all(scratch.path().join("world")).unwrap();
    std::fs::write(store.snapshot_path(), b"{ not json").unwrap();

    let err = store.load_snapshot().unwrap_err();
    assert!(matches!(err, StoreError::Serialization { .. }));
}

#[test]
fn unknown_fields_are_ignored_on_load() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (world, _) = ticked_world();
    let snapshot = snapshot_of(&world);

    let mut value = serde_json::to_value(&snapshot).unwrap();
    value["annotations"] = serde_json::json!({"note": "added by a later version"});
    std::fs::create_dir_all(scratch.path().join("world")).unwrap();
    std::fs::write(store.snapshot_path(), serde_json::to_vec(&value).unwrap()).unwrap();

    assert_eq!(store.load_snapshot().unwrap(), Some(snapshot));
}

#[test]
fn recent_events_come_back_in_emission_order() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    assert!(events.len() >= 3);

    store.save_events(&events).unwrap();
    let recent = store.recent_events(2).unwrap();

    assert_eq!(recent.as_slice(), &events[events.len() - 2..]);
    assert_eq!(store.recent_events(usize::MAX).unwrap(), events);
}

#[test]
fn no_temp_files_survive_a_save() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (world, _) = ticked_world();
    store.save_snapshot(&snapshot_of(&world)).unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(scratch.path().join("world"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name.to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

// =========================================================================
// PersistencePipeline
// =========================================================================

#[tokio::test]
async fn flush_writes_events_and_advances_watermark() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    let watermark = DurableWatermark::default();
    let pipeline =
        PersistencePipeline::spawn(store.clone(), watermark.clone(), Duration::from_secs(60));

    let handle = pipeline.handle();
    handle.persist_events(Arc::from(events.clone())).unwrap();
    let report = handle.flush().await.unwrap();

    assert!(report.is_clean());
    let last = events.last().unwrap().seq;
    assert_eq!(watermark.value(), last + 1);
    assert!(watermark.covers(last));
    assert_eq!(store.recent_events(usize::MAX).unwrap(), events);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_event_writes_are_retried_in_order() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    let blocker = scratch.path().join("events");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let watermark = DurableWatermark::default();
    let pipeline =
        PersistencePipeline::spawn(store.clone(), watermark.clone(), Duration::from_secs(60));
    let handle = pipeline.handle();
    handle.persist_events(Arc::from(events.clone())).unwrap();

    let blocked = handle.flush().await.unwrap();
    assert_eq!(blocked.pending_events, events.len());
    assert_eq!(watermark.value(), 0);

    std::fs::remove_file(&blocker).unwrap();
    let recovered = handle.flush().await.unwrap();
    assert!(recovered.is_clean());
    assert_eq!(store.recent_events(usize::MAX).unwrap(), events);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_interval_drains_without_new_commands() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    let blocker = scratch.path().join("events");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let watermark = DurableWatermark::default();
    let pipeline =
        PersistencePipeline::spawn(store, watermark.clone(), Duration::from_millis(20));
    let handle = pipeline.handle();
    handle.persist_events(Arc::from(events.clone())).unwrap();
    assert_eq!(handle.flush().await.unwrap().pending_events, events.len());

    std::fs::remove_file(&blocker).unwrap();
    let last = events.last().unwrap().seq;
    for _ in 0..100 {
        if watermark.covers(last) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(watermark.covers(last));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn persistent_failure_keeps_the_backlog_bounded() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    let cap = 2;
    assert!(events.len() > cap);
    let blocker = scratch.path().join("events");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let watermark = DurableWatermark::default();
    let pipeline = PersistencePipeline::spawn_with_backlog(
        store.clone(),
        watermark.clone(),
        Duration::from_secs(60),
        cap,
    );
    let handle = pipeline.handle();
    for event in &events {
        handle.persist_events(Arc::from(vec![event.clone()])).unwrap();
        let report = handle.flush().await.unwrap();
        assert!(report.pending_events <= cap);
    }
    let blocked = handle.flush().await.unwrap();
    assert_eq!(blocked.pending_events, cap);
    assert_eq!(blocked.dropped_events, (events.len() - cap) as u64);
    assert_eq!(watermark.value(), 0);

    // Only the newest events survive to be written once the store heals.
    std::fs::remove_file(&blocker).unwrap();
    let recovered = handle.flush().await.unwrap();
    assert!(recovered.is_clean());
    assert_eq!(
        store.recent_events(usize::MAX).unwrap(),
        events[events.len() - cap..].to_vec()
    );
    assert_eq!(watermark.value(), events.last().unwrap().seq + 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn large_backlogs_drain_across_several_write_batches() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (_, events) = ticked_world();
    let template = events[0].clone();
    let count = WRITE_BATCH * 2 + 3;
    let many: Vec<Event> = (0..count as u64)
        .map(|seq| Event {
            seq,
            ..template.clone()
        })
        .collect();

    let watermark = DurableWatermark::default();
    let pipeline =
        PersistencePipeline::spawn(store.clone(), watermark.clone(), Duration::from_secs(60));
    let handle = pipeline.handle();
    handle.persist_events(Arc::from(many)).unwrap();
    let report = handle.flush().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(watermark.value(), count as u64);
    assert_eq!(store.recent_events(usize::MAX).unwrap().len(), count);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_writes_latest_snapshot() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (mut world, _) = ticked_world();
    let first = snapshot_of(&world);
    world.tick(1.0).unwrap();
    let latest = snapshot_of(&world);

    let pipeline = PersistencePipeline::spawn(
        store.clone(),
        DurableWatermark::default(),
        Duration::from_secs(60),
    );
    let handle = pipeline.handle();
    handle.persist_snapshot(Arc::new(first)).unwrap();
    handle.persist_snapshot(Arc::new(latest.clone())).unwrap();

    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(store.load_snapshot().unwrap(), Some(latest));

    assert!(matches!(
        handle.persist_snapshot(Arc::new(snapshot_of(&world))),
        Err(StoreError::Closed)
    ));
}

#[tokio::test]
async fn persisted_snapshot_resumes_the_same_trajectory() {
    let scratch = Scratch::new();
    let store = FileStore::open(scratch.path()).unwrap();
    let (mut original, _) = ticked_world();
    store.save_snapshot(&snapshot_of(&original)).unwrap();

    let loaded = store.load_snapshot().unwrap().unwrap();
    let mut resumed = World::standard(WorldSettings::new("blank", 0)).unwrap();
    resumed.restore(&loaded).unwrap();
    resumed.start().unwrap();

    for _ in 0..3 {
        let a = original.tick(1.0).unwrap();
        let b = resumed.tick(1.0).unwrap();
        assert_eq!(a.events, b.events);
    }
    assert_eq!(snapshot_of(&original), snapshot_of(&resumed));
}
