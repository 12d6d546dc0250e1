use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::service::SystemStatus;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/v1/system/status", get(status))
        .route("/api/v1/system/refresh-data", post(refresh))
}

async fn status(State(service): State<AppState>) -> Json<SystemStatus> {
    Json(service.status())
}

#[derive(Serialize)]
struct RefreshResponse {
    status: &'static str,
    cities_ranked: usize,
    timestamp: DateTime<Utc>,
}

/// Expire every cached result and recompute rankings immediately.
async fn refresh(State(service): State<AppState>) -> Json<RefreshResponse> {
    // ---
    tracing::info!("POST /api/v1/system/refresh-data");
    let cities_ranked = service.refresh().await;
    Json(RefreshResponse {
        status: "refreshed",
        cities_ranked,
        timestamp: service.now(),
    })
}
