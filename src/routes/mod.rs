//! Routes gateway.
//!
//! Each sibling module exports a subrouter; this module merges them, attaches
//! the shared [`AirQualityService`] as state, and owns the mapping from
//! [`CoreError`] to HTTP responses. `main.rs` only sees [`router`].

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;

use crate::{AirQualityService, CoreError};

mod air_quality;
mod health;
mod system;

// ---

pub type AppState = Arc<AirQualityService>;

pub fn router(service: AppState) -> Router {
    // ---
    Router::new()
        .merge(air_quality::router())
        .merge(system::router())
        .merge(health::router())
        .with_state(service)
}

/// A [`CoreError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        // ---
        match self.0 {
            CoreError::SchemaDrift(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::UnknownSensor(_) | CoreError::NoData => StatusCode::NOT_FOUND,
            CoreError::ForecastUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
