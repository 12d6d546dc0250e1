//! Error taxonomy for the core.
//!
//! Ingestion data problems are [`Rejection`]s: counted and dropped, never
//! propagated. Everything that can reach a caller is a [`CoreError`].

use chrono::{DateTime, Utc};
use thiserror::Error;

// ---

/// Why a single reading was dropped before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("aqi missing or outside 0..=500")]
    InvalidAqi,

    #[error("reading at {timestamp} is older than watermark {watermark} minus retention")]
    TooStale {
        timestamp: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
}

/// Failure of the durable aggregate store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("stored row is malformed: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Incoming batch does not have the expected shape. Needs an operator.
    #[error("schema drift in incoming batch: {0}")]
    SchemaDrift(String),

    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(String),

    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no data available")]
    NoData,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type CoreResult<T> = Result<T, CoreError>;
