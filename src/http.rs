// src/http.rs
//! HTTP shell: signaling WebSocket, TURN credential REST endpoint, health
//! and optional static assets.

use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::credentials::CredentialIssuer;
use crate::signaling::{serve_socket, SignalingHub};
use crate::turn::{TurnServer, TurnStatsSnapshot};

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SignalingHub>,
    pub issuer: Arc<CredentialIssuer>,
    pub turn: Option<Arc<TurnServer>>,
    pub config: Arc<ServerConfig>,
}

#[derive(Debug, Deserialize)]
struct TurnQuery {
    #[serde(default)]
    service: String,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    version: &'static str,
    peers: usize,
    connections: usize,
    allocations: usize,
    #[serde(flatten)]
    turn: Option<TurnStatsSnapshot>,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route(&state.config.general.signaling_path, get(signaling_handler))
        .route("/api/turn", get(turn_credentials_handler))
        .route("/api/health", get(health_handler));

    if let Some(root) = &state.config.general.html_root {
        app = app.fallback_service(ServeDir::new(root));
    }

    app.layer(CorsLayer::permissive()).with_state(state)
}

/// Serve the router on `listener` until the future is dropped
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    info!("HTTP listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let idle_timeout = state.config.general.idle_timeout();
    ws.on_upgrade(move |socket| async move {
        debug!("Signaling connection established");
        serve_socket(state.hub, socket, idle_timeout).await;
    })
}

async fn turn_credentials_handler(Query(query): Query<TurnQuery>, State(state): State<AppState>) -> Response {
    if query.service != "turn" {
        warn!("Credential request for unknown service {:?}", query.service);
        return bad_request("service must be \"turn\"");
    }
    if query.username.is_empty() {
        return bad_request("username is required");
    }

    match state
        .issuer
        .issue(&query.username, state.config.turn.credential_ttl_secs)
    {
        Ok(credential) => {
            debug!("Issued TURN credential {}", credential.username);
            Json(credential).into_response()
        }
        Err(e) => {
            warn!("Refused TURN credential for {:?}: {}", query.username, e);
            bad_request(&e.to_string())
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        version: crate::VERSION,
        peers: state.hub.peer_count(),
        connections: state.hub.connection_count(),
        allocations: state.turn.as_ref().map_or(0, |t| t.allocations().len()),
        turn: state.turn.as_ref().map(|t| t.stats()),
    })
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
