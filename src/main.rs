//! Application entry point for the `airsense` service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Selecting the aggregate store (PostgreSQL when `DATABASE_URL` is set,
//!   in-memory otherwise) and creating the schema if needed
//! - Restoring aggregates from retained readings
//! - Starting maintenance and source polling tasks
//! - Binding the Axum HTTP server and serving until Ctrl-C
//!
//! # Environment Variables
//! See [`airsense::config::load_from_env`]. Logging is controlled by:
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colors on or off
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use airsense::cache::SystemClock;
use airsense::forecast::{ForecastGateway, ForecastModel, HttpForecastModel, NoModel};
use airsense::source::SensorSource;
use airsense::store::{AggregateStore, MemoryStore, PgStore};
use airsense::{config, routes, scheduler, schema, AirQualityService, Config};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let store = open_store(&cfg).await?;

    let model: Arc<dyn ForecastModel> = match cfg.forecast_url.as_deref() {
        Some(url) => Arc::new(HttpForecastModel::new(url)),
        None => {
            tracing::warn!("FORECAST_API_URL not set, predictions will be unavailable");
            Arc::new(NoModel)
        }
    };
    let gateway = ForecastGateway::new(model, cfg.forecast_timeout());

    let service = Arc::new(AirQualityService::new(
        store,
        gateway,
        Arc::new(SystemClock),
        cfg.service_options(),
    ));
    service.restore().await?;

    let cancel = CancellationToken::new();
    let mut tasks = vec![scheduler::spawn_maintenance(
        service.clone(),
        cfg.maintenance_interval(),
        cancel.clone(),
    )];
    match cfg.api_url.as_deref() {
        Some(url) => tasks.push(scheduler::spawn_poller(
            service.clone(),
            SensorSource::new(url, cfg.api_max_pages),
            cfg.poll_interval(),
            cancel.clone(),
        )),
        None => tracing::info!("SENSOR_API_URL not set, source polling disabled"),
    }

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(service);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn AggregateStore>> {
    // ---
    let Some(db_url) = cfg.db_url.as_deref() else {
        tracing::warn!(
            "DATABASE_URL not set, using in-memory store; data will not survive restarts"
        );
        return Ok(Arc::new(MemoryStore::new()));
    };

    tracing::info!("Attempting to connect to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

async fn shutdown_signal() {
    // ---
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, falling back to `AXUM_LOG_LEVEL`
///
/// Call once at startup, before any logging macros run.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info,reqwest=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
