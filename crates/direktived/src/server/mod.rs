//! HTTP surface: health endpoints, the cloud-facing webhook, and the
//! dashboard WebSocket command API.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::directives::Coordinator;
use crate::entry::EntryStore;
use crate::hass::HomeAssistant;

mod webhook;
mod ws;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    version: &'static str,
    pub entry: Arc<Mutex<EntryStore>>,
    pub coordinator: Arc<Coordinator>,
    pub hass: Arc<dyn HomeAssistant>,
}

impl AppState {
    pub fn new(
        entry: Arc<Mutex<EntryStore>>,
        coordinator: Arc<Coordinator>,
        hass: Arc<dyn HomeAssistant>,
    ) -> Self {
        AppState {
            version: env!("CARGO_PKG_VERSION"),
            entry,
            coordinator,
            hass,
        }
    }
}

/// Handler for GET /v1/ping
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
async fn info(State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");
    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
        }),
    )
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/api/webhook/:webhook_id", post(webhook::handle))
        .route("/ws", get(ws::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// Binds to the given address and serves until the shutdown signal fires.
pub async fn serve(
    listen: String,
    port: u16,
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP server shutting down gracefully");
        })
        .await?;

    Ok(())
}
