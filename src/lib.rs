//! `airsense`: air quality ingestion, hourly aggregation, city ranking and
//! cached forecasts.
//!
//! Modules follow the Explicit Module Boundary Pattern (EMBP): each one
//! exposes a small surface and the binary in `main.rs` only wires them
//! together.

pub mod aggregator;
pub mod cache;
pub mod categorizer;
pub mod config;
pub mod error;
pub mod forecast;
pub mod models;
pub mod ranker;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod source;
pub mod store;
pub mod validator;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use service::AirQualityService;
