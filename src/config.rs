//! Configuration loader for the `airsense` service.
//!
//! All runtime configuration values and their defaults are loaded here from
//! environment variables (with optional `.env` file support provided by the
//! caller), so no other module reads `env::var` directly.
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Duration as ChronoDuration;

use crate::cache::TtlPolicy;
use crate::service::ServiceOptions;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional string environment variable; empty counts as unset.
macro_rules! optional_env {
    ($var_name:expr) => {
        env::var($var_name).ok().filter(|v| !v.trim().is_empty())
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string. `None` runs on the in-memory store.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub listen_port: u16,

    /// Sensor data API base URL. `None` disables polling.
    pub api_url: Option<String>,

    /// Maximum number of API pages to fetch per poll (safety limit).
    pub api_max_pages: u32,

    pub poll_interval_secs: u32,

    /// Forecast model base URL. `None` leaves forecasts unavailable.
    pub forecast_url: Option<String>,

    pub forecast_timeout_ms: u32,
    pub forecast_refresh_secs: u32,
    pub retention_days: u32,
    pub current_ttl_secs: u32,
    pub historical_ttl_per_day_secs: u32,
    pub maintenance_interval_secs: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `DATABASE_URL` – PostgreSQL connection string (unset: in-memory store)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_PORT` – HTTP port (default: 8080)
/// - `SENSOR_API_URL` – upstream sensor API (unset: no polling)
/// - `API_MAX_PAGES` – max API pages per poll (default: 100)
/// - `POLL_INTERVAL_SECS` – poll cadence (default: 300)
/// - `FORECAST_API_URL` – forecast model endpoint (unset: unavailable)
/// - `FORECAST_TIMEOUT_MS` – hard forecast timeout (default: 300)
/// - `FORECAST_REFRESH_SECS` – prediction refresh period (default: 1800)
/// - `RETENTION_DAYS` – aggregate retention (default: 7)
/// - `CURRENT_TTL_SECS` – current/summary/rankings TTL (default: 30)
/// - `HISTORICAL_TTL_PER_DAY_SECS` – historical TTL per day (default: 60)
/// - `MAINTENANCE_INTERVAL_SECS` – maintenance cadence (default: 60)
///
/// Returns an error if any variable is present but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = optional_env!("DATABASE_URL");
    let api_url = optional_env!("SENSOR_API_URL");
    let forecast_url = optional_env!("FORECAST_API_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let listen_port = parse_env_u32!("LISTEN_PORT", 8080);
    let api_max_pages = parse_env_u32!("API_MAX_PAGES", 100);
    let poll_interval_secs = parse_env_u32!("POLL_INTERVAL_SECS", 300);
    let forecast_timeout_ms = parse_env_u32!("FORECAST_TIMEOUT_MS", 300);
    let forecast_refresh_secs = parse_env_u32!("FORECAST_REFRESH_SECS", 1800);
    let retention_days = parse_env_u32!("RETENTION_DAYS", 7);
    let current_ttl_secs = parse_env_u32!("CURRENT_TTL_SECS", 30);
    let historical_ttl_per_day_secs = parse_env_u32!("HISTORICAL_TTL_PER_DAY_SECS", 60);
    let maintenance_interval_secs = parse_env_u32!("MAINTENANCE_INTERVAL_SECS", 60);

    let listen_port = u16::try_from(listen_port)
        .map_err(|_| anyhow!("Invalid LISTEN_PORT: {} is out of range", listen_port))?;
    if retention_days == 0 {
        return Err(anyhow!("Invalid RETENTION_DAYS: must be at least 1"));
    }
    if forecast_refresh_secs == 0 {
        return Err(anyhow!("Invalid FORECAST_REFRESH_SECS: must be at least 1"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        listen_port,
        api_url,
        api_max_pages,
        poll_interval_secs,
        forecast_url,
        forecast_timeout_ms,
        forecast_refresh_secs,
        retention_days,
        current_ttl_secs,
        historical_ttl_per_day_secs,
        maintenance_interval_secs,
    })
}

impl Config {
    pub fn service_options(&self) -> ServiceOptions {
        // ---
        ServiceOptions {
            retention: ChronoDuration::days(i64::from(self.retention_days)),
            ttl: TtlPolicy {
                current: ChronoDuration::seconds(i64::from(self.current_ttl_secs)),
                historical_per_day: ChronoDuration::seconds(i64::from(
                    self.historical_ttl_per_day_secs,
                )),
                prediction_refresh: ChronoDuration::seconds(i64::from(
                    self.forecast_refresh_secs,
                )),
                ..TtlPolicy::default()
            },
        }
    }

    pub fn forecast_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.forecast_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.poll_interval_secs))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.maintenance_interval_secs))
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the database password.
    pub fn log_config(&self) {
        // ---
        let unset = || "(unset)".to_string();
        let masked_db_url = self.db_url.as_deref().map(mask_password).unwrap_or_else(unset);

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL                : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX                 : {}", self.db_pool_max);
        tracing::info!("  LISTEN_PORT                 : {}", self.listen_port);
        tracing::info!(
            "  SENSOR_API_URL              : {}",
            self.api_url.clone().unwrap_or_else(unset)
        );
        tracing::info!("  API_MAX_PAGES               : {}", self.api_max_pages);
        tracing::info!("  POLL_INTERVAL_SECS          : {}", self.poll_interval_secs);
        tracing::info!(
            "  FORECAST_API_URL            : {}",
            self.forecast_url.clone().unwrap_or_else(unset)
        );
        tracing::info!("  FORECAST_TIMEOUT_MS         : {}", self.forecast_timeout_ms);
        tracing::info!("  FORECAST_REFRESH_SECS       : {}", self.forecast_refresh_secs);
        tracing::info!("  RETENTION_DAYS              : {}", self.retention_days);
        tracing::info!("  CURRENT_TTL_SECS            : {}", self.current_ttl_secs);
        tracing::info!(
            "  HISTORICAL_TTL_PER_DAY_SECS : {}",
            self.historical_ttl_per_day_secs
        );
        tracing::info!(
            "  MAINTENANCE_INTERVAL_SECS   : {}",
            self.maintenance_interval_secs
        );
    }
}

/// Replace the password in a connection URL with `****`.
fn mask_password(url: &str) -> String {
    // ---
    let authority = url.find("://").map_or(0, |i| i + 3);
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':').filter(|&c| c >= authority) {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
