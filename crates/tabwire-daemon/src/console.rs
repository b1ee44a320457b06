//! Local HTTP console for inspecting the hub and issuing calls by hand.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tabwire_hub::{BroadcastReport, CallError, Hub};
use tabwire_relay::Relay;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ConsoleState {
    hub: Hub,
    relay: Option<Arc<Relay>>,
}

pub fn router(hub: Hub, relay: Option<Arc<Relay>>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/call/{key}", post(call))
        .route("/api/broadcast", post(broadcast))
        .with_state(ConsoleState { hub, relay })
}

/// Serve `router` until `shutdown` fires.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Console listening on http://{}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub peers: Vec<PeerStatus>,
    pub pending_calls: usize,
    pub selector: &'static str,
    pub uptime_secs: u64,
    pub relay: Option<RelayStatus>,
}

#[derive(Debug, Serialize)]
pub struct PeerStatus {
    pub id: u64,
    pub name: String,
    pub active_calls: usize,
}

#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub state: String,
    pub client_id: String,
    pub reconnects: u64,
}

async fn status(State(state): State<ConsoleState>) -> Json<Status> {
    let peers = state
        .hub
        .connections()
        .await
        .iter()
        .map(|c| PeerStatus {
            id: c.id(),
            name: c.name().to_string(),
            active_calls: c.active_calls(),
        })
        .collect();

    Json(Status {
        peers,
        pending_calls: state.hub.pending_calls(),
        selector: state.hub.selector_name(),
        uptime_secs: state.hub.uptime().as_secs(),
        relay: state.relay.as_ref().map(|relay| RelayStatus {
            state: relay.state().to_string(),
            client_id: relay.identity().client_id().to_string(),
            reconnects: relay.reconnects(),
        }),
    })
}

#[derive(Deserialize)]
struct CallParams {
    timeout_ms: Option<u64>,
}

async fn call(
    State(state): State<ConsoleState>,
    Path(key): Path<String>,
    Query(params): Query<CallParams>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.hub.config().default_call_timeout);
    let data = state.hub.call(&key, body, timeout).await?;
    Ok(Json(data))
}

#[derive(Deserialize)]
struct BroadcastRequest {
    action: String,
    #[serde(default)]
    payload: Value,
}

async fn broadcast(
    State(state): State<ConsoleState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastReport>, StatusCode> {
    state
        .hub
        .push_command(req.action, req.payload)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!("Broadcast could not be encoded: {}", e);
            StatusCode::BAD_REQUEST
        })
}

/// A failed call, as an HTTP response.
pub struct ApiError(CallError);

impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CallError::NoPeer(_) => StatusCode::SERVICE_UNAVAILABLE,
            CallError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CallError::Remote(_) | CallError::Send(_) | CallError::PeerDisconnected(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        let body = match &self.0 {
            CallError::Remote(remote) => json!({"error": remote.message, "code": remote.code}),
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
