use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::control::{parse_status, Control};
use crate::error::ControlError;
use crate::mqtt::Uplink;
use crate::state::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub uplink: Arc<Uplink>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/power", get(set_power))
        .route("/light", get(set_light))
        .route("/relay1", get(set_relay1))
        .route("/relay2", get(set_relay2))
        .route("/api/status", get(api_status))
        .route("/api/emergency", post(api_emergency))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct Reply {
    status: &'static str,
    message: String,
}

fn success(message: String) -> Response {
    (StatusCode::OK, Json(Reply { status: "success", message })).into_response()
}

fn failure(code: StatusCode, message: String) -> Response {
    (code, Json(Reply { status: "error", message })).into_response()
}

async fn set_power(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Response {
    control(&state.store, Control::Power, q).await
}

async fn set_light(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Response {
    control(&state.store, Control::Light, q).await
}

async fn set_relay1(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Response {
    control(&state.store, Control::Relay1, q).await
}

async fn set_relay2(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> Response {
    control(&state.store, Control::Relay2, q).await
}

async fn control(store: &StateStore, control: Control, q: StatusQuery) -> Response {
    let raw = q.status.unwrap_or_default();
    let result = match parse_status(&raw) {
        Ok(on) => store.set_output(control, on).await.map(|()| on),
        Err(e) => Err(e),
    };

    match result {
        Ok(on) => {
            info!(%control, on, "http control applied");
            success(format!("{control} turned {}", if on { "on" } else { "off" }))
        }
        Err(e @ ControlError::InvalidStatus(_)) => {
            warn!(%control, error = %e, "http control rejected");
            failure(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e @ ControlError::BlockedByEmergency(_)) => {
            warn!(%control, error = %e, "http control blocked");
            failure(StatusCode::CONFLICT, e.to_string())
        }
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.status_report().await)
}

#[derive(Debug, Default, Deserialize)]
struct EmergencyRequest {
    #[serde(default)]
    reason: String,
}

async fn api_emergency(
    State(state): State<AppState>,
    Json(req): Json<EmergencyRequest>,
) -> Response {
    let reason = match req.reason.trim() {
        "" => "Manual emergency power off".to_string(),
        r => r.to_string(),
    };

    if let Some(notice) = state.store.emergency_power_off(&reason).await {
        state.uplink.send_notice(&notice);
    }
    success(format!("emergency power off: {reason}"))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http control listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
