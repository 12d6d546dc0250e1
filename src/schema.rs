//! Database schema management for `airsense`.
//!
//! Ensures required tables and indexes exist before the PostgreSQL store
//! serves requests. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `air_quality_readings` table for validated readings and the
/// `hourly_aggregates` table for per-sensor rollups. Both are keyed so that
/// re-ingestion upserts instead of duplicating. Safe to call on every
/// startup; no-op if objects already exist.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS air_quality_readings (
            sensor_id      TEXT             NOT NULL,
            timestamp      TIMESTAMPTZ      NOT NULL,
            location_name  TEXT             NOT NULL,
            latitude       DOUBLE PRECISION NOT NULL,
            longitude      DOUBLE PRECISION NOT NULL,
            aqi            DOUBLE PRECISION NOT NULL,
            pm25           DOUBLE PRECISION,
            pm10           DOUBLE PRECISION,
            no2            DOUBLE PRECISION,
            o3             DOUBLE PRECISION,
            co             DOUBLE PRECISION,
            temperature    DOUBLE PRECISION,
            humidity       DOUBLE PRECISION,
            pressure       DOUBLE PRECISION,
            wind_speed     DOUBLE PRECISION,
            wind_direction DOUBLE PRECISION,
            visibility     DOUBLE PRECISION,
            created_at     TIMESTAMPTZ      NOT NULL,
            PRIMARY KEY (sensor_id, timestamp)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Category and health status are cached on write; the categorizer stays
    // the source of truth on read.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hourly_aggregates (
            sensor_id       TEXT             NOT NULL,
            hour            TIMESTAMPTZ      NOT NULL,
            location_name   TEXT             NOT NULL,
            avg_aqi         DOUBLE PRECISION NOT NULL,
            min_aqi         DOUBLE PRECISION NOT NULL,
            max_aqi         DOUBLE PRECISION NOT NULL,
            avg_pm25        DOUBLE PRECISION,
            avg_pm10        DOUBLE PRECISION,
            avg_no2         DOUBLE PRECISION,
            avg_o3          DOUBLE PRECISION,
            avg_co          DOUBLE PRECISION,
            avg_temperature DOUBLE PRECISION,
            avg_humidity    DOUBLE PRECISION,
            avg_pressure    DOUBLE PRECISION,
            avg_wind_speed  DOUBLE PRECISION,
            reading_count   BIGINT           NOT NULL CHECK (reading_count >= 1),
            aqi_category    TEXT             NOT NULL,
            health_status   TEXT             NOT NULL,
            PRIMARY KEY (sensor_id, hour)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_air_quality_readings_timestamp
            ON air_quality_readings (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_hourly_aggregates_hour
            ON hourly_aggregates (hour);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
