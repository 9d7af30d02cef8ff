//! Read-only observer API for the Tellus world simulation.
//!
//! An Axum server exposing:
//!
//! - **REST endpoints** for the latest world snapshot, single entities,
//!   recent events, and operator status
//! - **`WebSocket` endpoint** (`/ws/ticks`) streaming one message per
//!   completed tick via [`tokio::sync::broadcast`]
//!
//! # Architecture
//!
//! The engine publishes an `Arc<WorldSnapshot>` and the tick's events into
//! [`AppState`] after every tick. Handlers only ever read that published
//! view, so the observer cannot slow down or alter the world.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use error::ObserverError;
pub use router::build_router;
pub use server::{ServerConfig, ServerError, bind, serve, start_server};
pub use state::{AppState, DEFAULT_EVENT_CAPACITY, ObserverView, TickBroadcast};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        use ts_rs::TS;

        let _ = crate::state::TickBroadcast::export_all();
    }
}
