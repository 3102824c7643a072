//! HTTP dispatch for the approval-relay protocol.
//!
//! Thin glue only: routes verbs and paths onto the protocol core and
//! relays to the web-push engine on request creation. No protocol logic
//! lives here - both generations' handlers feed the same authenticator
//! and the same actor APIs.
//!
//! # Routes
//!
//! ```text
//! current   POST /v2/request            GET /v2/decision/{id}
//! legacy    POST /request               GET /request/{id}
//!           POST /decision/{id}         GET /decision/{id}
//!           GET  /requests/pending
//! pairing   POST /pair/init             POST /pair/register-push
//! misc      GET  /vapid-public-key      GET /health
//! ```

mod routes;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::approvals::Approvals;
use crate::config::ServerConfig;
use crate::registry::DeviceRegistry;
use crate::webpush::{VapidKeys, WebPushClient};

/// Shared state behind every handler.
#[derive(Debug)]
pub struct AppState {
    /// Per-pairing device actors.
    pub registry: DeviceRegistry,
    /// Per-pairing approval actors.
    pub approvals: Approvals,
    /// Outbound push delivery.
    pub push: WebPushClient,
}

impl AppState {
    /// Assemble server state from its parts.
    pub fn new(registry: DeviceRegistry, push: WebPushClient) -> Self {
        Self {
            registry,
            approvals: Approvals::new(),
            push,
        }
    }
}

/// Build the axum router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Current generation: credentials in headers.
        .route("/v2/request", post(routes::create_request_v2))
        .route("/v2/decision/{id}", get(routes::poll_decision_v2))
        // Legacy generation: credentials embedded in body/query.
        .route("/request", post(routes::create_request_legacy))
        .route("/request/{id}", get(routes::get_request_legacy))
        .route(
            "/decision/{id}",
            post(routes::submit_decision_legacy).get(routes::poll_decision_legacy),
        )
        .route("/requests/pending", get(routes::list_pending_legacy))
        // Pairing and discovery.
        .route("/pair/init", post(routes::pair_init))
        .route("/pair/register-push", post(routes::register_push))
        .route("/vapid-public-key", get(routes::vapid_public_key))
        .route("/health", get(routes::health))
        .with_state(state)
}

/// Run the server until the process is stopped.
pub async fn run(config: ServerConfig) -> Result<()> {
    let keys = VapidKeys::load_or_generate(&config.vapid_path())?;
    let push = WebPushClient::new(keys, config.subject.clone());
    let state = Arc::new(AppState::new(
        DeviceRegistry::new(config.state_dir.clone()),
        push,
    ));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    log::info!("[Server] Listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .await
        .context("Server error")
}
