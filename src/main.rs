//! ==============================================================================
//! main.rs - smart-cycle hub entry point
//! ==============================================================================
//!
//! purpose:
//!     the server every tracked bike reports to and every dashboard listens
//!     on. bikes (or the bike-sim binary) post telemetry; the hub checks
//!     each report against the active geofence and the bike's speed limit,
//!     stores it, and pushes the result to connected dashboards.
//!
//! responsibilities:
//!     - load hub.toml and set up logging
//!     - create the data directory layout and load persisted state
//!     - serve the REST api and the /ws endpoint on one port
//!     - shut down cleanly on ctrl+c / SIGTERM
//!
//! relationships:
//!     - config.rs       runtime configuration
//!     - state.rs        wires the services together
//!     - routes.rs       REST handlers
//!     - socket.rs       websocket sessions
//!     - hub.rs          event fan-out shared by both
//!     - bike.rs, geofence.rs, speed_limit.rs   the domain services
//!     - store.rs        json files on disk
//!
//! architecture:
//!
//!     ┌──────────┐  POST /api/bike/data   ┌───────────────────────────────┐
//!     │  bikes   │ ─────────────────────> │            hub (this)         │
//!     └──────────┘                        │  ┌────────┐   ┌────────────┐  │
//!                                         │  │ routes │──>│ BikeService│  │
//!     ┌──────────┐  REST + /ws            │  └────────┘   └─────┬──────┘  │
//!     │dashboards│ <────────────────────> │  ┌────────┐   geofence │      │
//!     └──────────┘                        │  │ socket │   speed    │      │
//!                                         │  └───┬────┘   limits   ▼      │
//!                                         │      └──── Hub <── events     │
//!                                         └──────────────┬────────────────┘
//!                                                        ▼
//!                                                  data/*.json
//!
//! ==============================================================================

mod bike;
mod config;
mod domain;
mod error;
mod geofence;
mod hub;
mod routes;
mod socket;
mod speed_limit;
mod state;
mod store;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{HubConfig, ServerConfig};
use crate::state::AppState;

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration, read before logging so the level can come from it.
    // nothing is logged here; a broken file is returned as an error instead.
    let (config, source) = HubConfig::load_or_default()?;

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    fmt().with_env_filter(filter).init();

    info!("===========================================================");
    info!("  Smart-Cycle Hub");
    info!("===========================================================");
    config.log_source(source.as_deref());

    // step 3: data directory and services
    let state = AppState::init(config.clone()).await?;

    // step 4: http + websocket server
    let app = routes::router(state.clone())
        .layer(cors_layer(&config.server))
        .layer(TraceLayer::new_for_http());

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;

    info!("Server running on http://{address}");
    info!("WebSocket endpoint ws://{address}/ws");
    info!("Health check http://{address}/health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped ({} clients were connected)", state.hub.connected_clients());
    Ok(())
}

// ==============================================================================
// helpers
// ==============================================================================

/// "*" allows any origin, otherwise a comma separated allow-list
fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS];
    let base = CorsLayer::new().allow_methods(methods).allow_headers(Any);

    if server.cors_origin.trim() == "*" {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .cors_origin
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {o}");
                None
            }
        })
        .collect();
    base.allow_origin(origins)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
