//! LanBeam directory server: presence HTTP API and relay socket.

pub mod config;
pub mod http;
pub mod relay;
pub mod state;

use axum::{routing::get, Router};

pub use state::AppState;

/// Presence routes under `/api` and at the root, relay socket at `/ws`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", http::routes())
        .merge(http::routes())
        .route("/ws", get(relay::ws_handler))
        .with_state(state)
}
