//! Integration tests for the observer API endpoints.
//!
//! Requests go through the `Router` via `tower::ServiceExt` without
//! binding a TCP port.

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::float_cmp)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tellus_core::config::SimulationBoundsConfig;
use tellus_core::{OperatorState, World, WorldSettings};
use tellus_observer::router::build_router;
use tellus_observer::state::{AppState, TickBroadcast};
use tellus_systems::EnvironmentSystem;
use tellus_types::{AgentRecord, Event, Position, PropertyMap, WorldSnapshot};
use tellus_world::NewEntity;
use tower::ServiceExt;

fn agent(id: &str) -> AgentRecord {
    AgentRecord {
        id: id.to_owned(),
        name: id.to_uppercase(),
        position: Position::new(0.0, 0.0),
        attributes: PropertyMap::new(),
        born_at_hours: 0.0,
    }
}

/// Tick a small world three times and return each tick's snapshot and
/// events.
fn ticks() -> Vec<(Arc<WorldSnapshot>, Vec<Event>)> {
    let mut world = World::standard(WorldSettings::new("observed", 3)).unwrap();
    assert!(world.spawn_agent(agent("ada")));
    assert!(world.spawn_agent(agent("bo")));
    let environment = world.subsystem_mut::<EnvironmentSystem>().unwrap();
    assert!(environment.create_region(NewEntity::new("lowlands", "plain")));
    world.start().unwrap();

    (0..3)
        .map(|_| {
            let outcome = world.tick(1.0).unwrap();
            (
                Arc::new(world.snapshot().unwrap()),
                outcome.events.to_vec(),
            )
        })
        .collect()
}

fn published_state(state: AppState) -> Arc<AppState> {
    for (snapshot, events) in ticks() {
        assert!(state.try_publish(snapshot, &events));
    }
    Arc::new(state)
}

async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
    let app = build_router(state);
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn world_is_unavailable_before_first_tick() {
    let (status, body) = get(Arc::new(AppState::new()), "/api/world").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], 503);
}

#[tokio::test]
async fn world_returns_latest_snapshot() {
    let state = published_state(AppState::new());
    let (status, body) = get(state, "/api/world").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tick"], 3);
    assert_eq!(body["world_name"], "observed");
    assert!(body["agents"]["ada"].is_object());
}

#[tokio::test]
async fn entity_lookup_covers_registries_and_agents() {
    let state = published_state(AppState::new());

    let (status, body) = get(Arc::clone(&state), "/api/entities/region/lowlands").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["category"], "region");
    assert_eq!(body["entity"]["name"], "lowlands");

    let (status, body) = get(Arc::clone(&state), "/api/entities/agent/bo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"]["name"], "BO");

    let (status, _) = get(state, "/api/entities/region/atlantis").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_are_newest_last_and_limited() {
    let frames = ticks();
    let all: Vec<Event> = frames.iter().flat_map(|(_, events)| events.clone()).collect();
    let state = AppState::new();
    for (snapshot, events) in frames {
        assert!(state.try_publish(snapshot, &events));
    }
    let state = Arc::new(state);

    let (status, body) = get(Arc::clone(&state), "/api/events?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let returned: Vec<Event> = serde_json::from_value(body["events"].clone()).unwrap();
    assert_eq!(returned.as_slice(), &all[all.len() - 2..]);

    let (_, body) = get(Arc::clone(&state), "/api/events?tick=1&subsystem=world").await;
    let returned: Vec<Event> = serde_json::from_value(body["events"].clone()).unwrap();
    assert!(!returned.is_empty());
    assert!(returned.iter().all(|e| e.tick == 1 && e.subsystem == "world"));

    let (status, _) = get(state, "/api/events?limit=5000").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn event_tail_is_bounded() {
    let state = published_state(AppState::new().event_capacity(2));
    assert_eq!(state.recent_events(10).await.len(), 2);
}

#[tokio::test]
async fn status_needs_an_operator() {
    let (status, _) = get(Arc::new(AppState::new()), "/api/status").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let operator = Arc::new(OperatorState::new(
        1000,
        &SimulationBoundsConfig {
            max_ticks: 50,
            max_real_time_seconds: 0,
        },
    ));
    operator.pause();
    operator.record_tick(7, false);
    let (status, body) = get(Arc::new(AppState::with_operator(operator)), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tick"], 7);
    assert_eq!(body["paused"], true);
    assert_eq!(body["max_ticks"], 50);
}

#[tokio::test]
async fn publish_yields_while_a_reader_holds_the_lock() {
    let state = AppState::new();
    let frames = ticks();
    let (snapshot, events) = frames[0].clone();

    let guard = state.view.read().await;
    assert!(!state.try_publish(Arc::clone(&snapshot), &events));
    drop(guard);

    assert!(state.try_publish(snapshot, &events));
    assert_eq!(state.world().await.unwrap().tick, 1);
}

#[tokio::test]
async fn broadcast_reaches_subscribers() {
    let state = AppState::new();
    assert_eq!(
        state.broadcast(TickBroadcast {
            tick: 0,
            sim_time_hours: 0.0,
            timestamp: chrono_epoch(),
            agents: 0,
            entities: 0,
            faults: 0,
            events: Vec::new(),
        }),
        0
    );

    let mut rx = state.subscribe();
    let (snapshot, events) = ticks().remove(0);
    let message = TickBroadcast::from_tick(&snapshot, &events, 0);
    assert_eq!(state.broadcast(message.clone()), 1);

    let received = rx.recv().await.unwrap();
    assert_eq!(received, message);
    assert_eq!(received.tick, 1);
    assert_eq!(received.agents, 2);
    assert_eq!(received.events.len(), events.len());
    assert_eq!(received.sim_time_hours, 1.0);
}

#[tokio::test]
async fn index_page_renders() {
    let state = published_state(AppState::new());
    let app = build_router(state);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(html.contains("observed"));
    assert!(html.contains("/api/world"));
}

#[tokio::test]
async fn index_page_escapes_the_world_name() {
    let state = AppState::new();
    let (snapshot, events) = ticks().remove(0);
    let mut renamed = (*snapshot).clone();
    renamed.world_name = "<script>alert(1)</script>".to_owned();
    assert!(state.try_publish(Arc::new(renamed), &events));

    let app = build_router(Arc::new(state));
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!html.contains("<script>"));
    assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
}

fn chrono_epoch() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::UNIX_EPOCH
}

#[tokio::test]
async fn server_binds_and_shuts_down() {
    let config = tellus_observer::ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
    };
    let listener = tellus_observer::bind(&config).await.unwrap();
    assert_ne!(listener.local_addr().unwrap().port(), 0);
    tellus_observer::serve(listener, Arc::new(AppState::new()), async {})
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_host_is_a_bind_error() {
    let config = tellus_observer::ServerConfig {
        host: "not a host".to_owned(),
        port: 8080,
    };
    let err = tellus_observer::bind(&config).await.unwrap_err();
    assert!(matches!(err, tellus_observer::ServerError::Bind(_)));
}
