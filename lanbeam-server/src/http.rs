//! Presence HTTP surface: register, unregister, list devices.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lanbeam_core::directory::RegisterOutcome;
use lanbeam_core::{DirectoryError, PeerRecord, Registration};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::{now_ms, AppState};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterRequest {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    pub exclude: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/unregister", post(unregister))
        .route("/devices", get(devices))
}

fn ok() -> Response {
    Json(Ack {
        success: true,
        error: None,
    })
    .into_response()
}

fn rejected(e: DirectoryError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(Ack {
            success: false,
            error: Some(e.to_string()),
        }),
    )
        .into_response()
}

async fn register(State(state): State<AppState>, Json(reg): Json<Registration>) -> Response {
    let id = reg.id.clone().unwrap_or_default();
    let report = match state.directory().await.register(reg, now_ms()) {
        Ok(r) => r,
        Err(e) => return rejected(e),
    };
    for stale in &report.evicted {
        info!(event = "duplicate_evicted", peer = %stale, replaced_by = %id, "Evicted stale record with same name");
    }
    match report.outcome {
        RegisterOutcome::Created => info!(event = "registered", peer = %id, "Device registered"),
        RegisterOutcome::Refreshed => debug!(event = "heartbeat", peer = %id, "Device refreshed"),
        RegisterOutcome::Debounced => debug!(event = "debounced", peer = %id, "Registration debounced"),
    }
    ok()
}

async fn unregister(State(state): State<AppState>, Json(req): Json<UnregisterRequest>) -> Response {
    match state.directory().await.unregister(req.id.as_deref()) {
        Ok(true) => {
            info!(event = "unregistered", peer = %req.id.unwrap_or_default(), "Device unregistered");
            ok()
        }
        Ok(false) => ok(),
        Err(e) => rejected(e),
    }
}

async fn devices(
    State(state): State<AppState>,
    Query(q): Query<DevicesQuery>,
) -> Json<Vec<PeerRecord>> {
    let listing = state.directory().await.list(q.exclude.as_deref(), now_ms());
    for id in &listing.expired {
        info!(event = "expired", peer = %id, "Device expired");
    }
    Json(listing.peers)
}
