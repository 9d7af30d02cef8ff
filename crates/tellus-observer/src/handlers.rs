//! REST endpoint handlers for the observer API.
//!
//! Every handler reads the published [`ObserverView`] through
//! [`AppState`]; none of them touches the live world.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Minimal HTML status page |
//! | `GET` | `/api/world` | Latest world snapshot |
//! | `GET` | `/api/entities/{category}/{name}` | One entity (`agent` is a category) |
//! | `GET` | `/api/events` | Recent events |
//! | `GET` | `/api/status` | Operator status |
//!
//! [`ObserverView`]: crate::state::ObserverView

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse};
use tellus_types::{Event, WorldSnapshot};

use crate::error::ObserverError;
use crate::state::AppState;

/// Events returned when `limit` is omitted.
const DEFAULT_EVENT_LIMIT: usize = 100;

/// Upper bound for `limit`.
const MAX_EVENT_LIMIT: usize = 1000;

/// Query parameters for `GET /api/events`.
#[derive(Debug, serde::Deserialize)]
pub struct EventsQuery {
    /// Maximum number of events (default 100, at most 1000).
    pub limit: Option<usize>,
    /// Only events emitted during this tick.
    pub tick: Option<u64>,
    /// Only events from this subsystem.
    pub subsystem: Option<String>,
    /// Only events about this entity or agent.
    pub entity: Option<String>,
}

impl EventsQuery {
    fn matches(&self, event: &Event) -> bool {
        self.tick.is_none_or(|tick| event.tick == tick)
            && self
                .subsystem
                .as_deref()
                .is_none_or(|subsystem| event.subsystem == subsystem)
            && self
                .entity
                .as_deref()
                .is_none_or(|entity| event.entity.as_deref() == Some(entity))
    }
}

async fn latest_world(state: &AppState) -> Result<Arc<WorldSnapshot>, ObserverError> {
    state
        .world()
        .await
        .ok_or_else(|| ObserverError::Unavailable("no tick has completed yet".to_owned()))
}

// ---------------------------------------------------------------------------
// GET /
// ---------------------------------------------------------------------------

/// Serve a small HTML page with the current tick and the API routes.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let world = state.world().await;
    let name = world
        .as_ref()
        .map_or_else(|| "Tellus".to_owned(), |w| escape_html(&w.world_name));
    let tick = world.as_ref().map_or(0, |w| w.tick);
    let hours = world.as_ref().map_or(0.0, |w| w.sim_time_hours);
    let agents = world.as_ref().map_or(0, |w| w.agents.len());
    let entities = world.as_ref().map_or(0, |w| w.entity_records().count());

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>{name} Observer</title>
    <style>
        body {{ background: #0d1117; color: #c9d1d9; font-family: monospace; padding: 2rem; max-width: 760px; margin: 0 auto; }}
        h1 {{ color: #58a6ff; }}
        td {{ padding: 0.2rem 1.2rem 0.2rem 0; }}
        a {{ color: #58a6ff; }}
    </style>
</head>
<body>
    <h1>{name}</h1>
    <table>
        <tr><td>Tick</td><td>{tick}</td></tr>
        <tr><td>Simulated hours</td><td>{hours:.1}</td></tr>
        <tr><td>Agents</td><td>{agents}</td></tr>
        <tr><td>Entities</td><td>{entities}</td></tr>
    </table>
    <h2>API</h2>
    <ul>
        <li><a href="/api/world">/api/world</a></li>
        <li>/api/entities/{{category}}/{{name}}</li>
        <li><a href="/api/events?limit=50">/api/events?limit=N</a></li>
        <li><a href="/api/status">/api/status</a></li>
        <li>ws://host:port/ws/ticks</li>
    </ul>
</body>
</html>"#
    ))
}

/// Escape text for use inside HTML element content and attribute values.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// GET /api/world
// ---------------------------------------------------------------------------

/// Return the latest world snapshot.
pub async fn get_world(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let world = latest_world(&state).await?;
    Ok(Json(serde_json::to_value(world.as_ref())?))
}

// ---------------------------------------------------------------------------
// GET /api/entities/{category}/{name}
// ---------------------------------------------------------------------------

/// Return one entity by category and name.
pub async fn get_entity(
    State(state): State<Arc<AppState>>,
    Path((category, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ObserverError> {
    let world = latest_world(&state).await?;
    let entity = world
        .entity(&category, &name)
        .ok_or_else(|| ObserverError::NotFound(format!("{category} {name}")))?;

    Ok(Json(serde_json::json!({
        "category": category,
        "name": name,
        "tick": world.tick,
        "entity": entity,
    })))
}

// ---------------------------------------------------------------------------
// GET /api/events
// ---------------------------------------------------------------------------

/// Return the newest matching events, oldest first.
///
/// # Query Parameters
///
/// - `limit`: maximum events (default 100, at most 1000).
/// - `tick`, `subsystem`, `entity`: optional filters.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<impl IntoResponse, ObserverError> {
    let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    if limit > MAX_EVENT_LIMIT {
        return Err(ObserverError::InvalidQuery(format!(
            "limit {limit} exceeds {MAX_EVENT_LIMIT}"
        )));
    }

    let mut events: Vec<Event> = state
        .recent_events(usize::MAX)
        .await
        .into_iter()
        .filter(|event| params.matches(event))
        .collect();
    let excess = events.len().saturating_sub(limit);
    events.drain(..excess);

    Ok(Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    })))
}

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

/// Return the operator's view of the run: tick, pause and degraded
/// flags, limits, and end reason.
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ObserverError> {
    let operator = state
        .operator
        .as_ref()
        .ok_or_else(|| ObserverError::Unavailable("operator state not attached".to_owned()))?;
    Ok(Json(operator.status()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_characters_are_escaped() {
        assert_eq!(
            escape_html(r#"<b class="x">Tom & Jerry's</b>"#),
            "&lt;b class=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/b&gt;"
        );
        assert_eq!(escape_html("Pangaea"), "Pangaea");
    }
}
