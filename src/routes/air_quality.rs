use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, AppState};
use crate::models::{
    Alert, CityRanking, HourlyAggregate, IngestReport, PredictionResponse, Reading, SensorInfo,
    Summary,
};
use crate::CoreError;

// ---

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;
const DEFAULT_HOURS_AHEAD: u32 = 6;
const DEFAULT_DAYS: u32 = 7;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/v1/air-quality/current", get(current))
        .route("/api/v1/air-quality/summary", get(summary))
        .route("/api/v1/air-quality/rankings", get(rankings))
        .route("/api/v1/air-quality/sensors", get(sensors))
        .route("/api/v1/air-quality/alerts", get(alerts))
        .route("/api/v1/air-quality/predictions/{sensor_id}", get(predictions))
        .route("/api/v1/air-quality/historical/{sensor_id}", get(historical))
        .route("/api/v1/air-quality/readings", post(ingest))
}

/// Query parameters for `GET /current`.
#[derive(Debug, Deserialize)]
pub struct CurrentQuery {
    /// Case-insensitive substring of the location name.
    city: Option<String>,
    limit: Option<u32>,
}

async fn current(
    Query(params): Query<CurrentQuery>,
    State(service): State<AppState>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    // ---
    debug!("GET /current {:?}", params);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(CoreError::InvalidRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        ))
        .into());
    }

    let mut readings = service.get_current(params.city.as_deref()).await?;
    readings.truncate(limit as usize);
    Ok(Json(readings))
}

async fn summary(State(service): State<AppState>) -> Result<Json<Summary>, ApiError> {
    Ok(Json(service.get_summary().await?))
}

async fn rankings(State(service): State<AppState>) -> Result<Json<Vec<CityRanking>>, ApiError> {
    Ok(Json(service.get_rankings().await?))
}

async fn sensors(State(service): State<AppState>) -> Json<Vec<SensorInfo>> {
    Json(service.get_sensors())
}

async fn alerts(State(service): State<AppState>) -> Json<Vec<Alert>> {
    Json(service.get_alerts())
}

#[derive(Debug, Deserialize)]
pub struct PredictionQuery {
    hours_ahead: Option<u32>,
}

async fn predictions(
    Path(sensor_id): Path<String>,
    Query(params): Query<PredictionQuery>,
    State(service): State<AppState>,
) -> Result<Json<PredictionResponse>, ApiError> {
    // ---
    let hours_ahead = params.hours_ahead.unwrap_or(DEFAULT_HOURS_AHEAD);
    Ok(Json(service.get_predictions(&sensor_id, hours_ahead).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    days: Option<u32>,
}

async fn historical(
    Path(sensor_id): Path<String>,
    Query(params): Query<HistoricalQuery>,
    State(service): State<AppState>,
) -> Result<Json<Vec<HourlyAggregate>>, ApiError> {
    // ---
    let days = params.days.unwrap_or(DEFAULT_DAYS);
    Ok(Json(service.get_historical(&sensor_id, days).await?))
}

/// `POST /readings`: body is a JSON array of raw readings (or a
/// `{"results": [...]}` envelope). Anything else is schema drift.
async fn ingest(
    State(service): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    // ---
    let batch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            let err = CoreError::SchemaDrift(format!("body is not JSON: {}", e));
            service.record_schema_drift(&err);
            return Err(err.into());
        }
    };
    Ok(Json(service.ingest_json(batch).await?))
}
