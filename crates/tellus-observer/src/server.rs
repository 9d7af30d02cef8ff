//! Observer HTTP server lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tellus_core::config::ObserverConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Bind address for the observer server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// TCP port to listen on; `0` picks a free port.
    pub port: u16,
}

impl ServerConfig {
    /// Bind address from the `observer` config section.
    pub fn from_config(config: &ObserverConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 8080,
        }
    }
}

/// Bind the listener without serving yet.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address is invalid or taken.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;

    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))
}

/// Serve the observer API on a bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] if serving fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "Observer server listening"),
        Err(err) => info!(error = %err, "Observer server listening on unknown address"),
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))?;

    info!("Observer server stopped");
    Ok(())
}

/// Bind and serve until `shutdown` resolves.
///
/// # Errors
///
/// See [`bind`] and [`serve`].
pub async fn start_server(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = bind(config).await?;
    serve(listener, state, shutdown).await
}

/// Errors that can occur when starting or running the observer server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server failed while serving.
    #[error("serve error: {0}")]
    Serve(String),
}
