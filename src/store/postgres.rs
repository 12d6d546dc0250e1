use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::AggregateStore;
use crate::categorizer::{self, AqiCategory};
use crate::error::StoreError;
use crate::models::{HourlyAggregate, Reading};

// ---

/// Rows per multi-row INSERT; keeps bind parameters well under the
/// PostgreSQL limit of 65535.
const CHUNK_ROWS: usize = 1000;

/// PostgreSQL-backed store. Tables come from [`crate::schema::create_schema`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    sensor_id: String,
    hour: DateTime<Utc>,
    location_name: String,
    avg_aqi: f64,
    min_aqi: f64,
    max_aqi: f64,
    avg_pm25: Option<f64>,
    avg_pm10: Option<f64>,
    avg_no2: Option<f64>,
    avg_o3: Option<f64>,
    avg_co: Option<f64>,
    avg_temperature: Option<f64>,
    avg_humidity: Option<f64>,
    avg_pressure: Option<f64>,
    avg_wind_speed: Option<f64>,
    reading_count: i64,
    aqi_category: String,
}

impl TryFrom<AggregateRow> for HourlyAggregate {
    type Error = StoreError;

    fn try_from(row: AggregateRow) -> Result<Self, Self::Error> {
        // ---
        let reading_count = u32::try_from(row.reading_count)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "reading_count {} for {}@{}",
                    row.reading_count, row.sensor_id, row.hour
                ))
            })?;

        // The stored category is a write-time cache; recompute it.
        let category = categorizer::category(row.avg_aqi);
        if AqiCategory::parse(&row.aqi_category) != Some(category) {
            tracing::debug!(
                sensor = %row.sensor_id,
                hour = %row.hour,
                stored = %row.aqi_category,
                derived = category.as_str(),
                "stored category differs from current breakpoints"
            );
        }

        Ok(HourlyAggregate {
            sensor_id: row.sensor_id,
            location_name: row.location_name,
            hour: row.hour,
            avg_aqi: row.avg_aqi,
            min_aqi: row.min_aqi,
            max_aqi: row.max_aqi,
            avg_pm25: row.avg_pm25,
            avg_pm10: row.avg_pm10,
            avg_no2: row.avg_no2,
            avg_o3: row.avg_o3,
            avg_co: row.avg_co,
            avg_temperature: row.avg_temperature,
            avg_humidity: row.avg_humidity,
            avg_pressure: row.avg_pressure,
            avg_wind_speed: row.avg_wind_speed,
            reading_count,
            aqi_category: category,
            health_status: categorizer::health_status(row.avg_aqi),
        })
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_readings(&self, readings: &[Reading]) -> Result<(), StoreError> {
        // ---
        for chunk in readings.chunks(CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO air_quality_readings (
                    sensor_id, timestamp, location_name, latitude, longitude,
                    aqi, pm25, pm10, no2, o3, co, temperature, humidity,
                    pressure, wind_speed, wind_direction, visibility, created_at
                ) ",
            );
            builder.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(&r.sensor_id)
                    .push_bind(r.timestamp)
                    .push_bind(&r.location_name)
                    .push_bind(r.latitude)
                    .push_bind(r.longitude)
                    .push_bind(r.aqi)
                    .push_bind(r.pm25)
                    .push_bind(r.pm10)
                    .push_bind(r.no2)
                    .push_bind(r.o3)
                    .push_bind(r.co)
                    .push_bind(r.temperature)
                    .push_bind(r.humidity)
                    .push_bind(r.pressure)
                    .push_bind(r.wind_speed)
                    .push_bind(r.wind_direction)
                    .push_bind(r.visibility)
                    .push_bind(r.created_at);
            });
            // Overwrite entirely: a repeated key replaces the prior reading.
            builder.push(
                " ON CONFLICT (sensor_id, timestamp) DO UPDATE SET
                    location_name  = EXCLUDED.location_name,
                    latitude       = EXCLUDED.latitude,
                    longitude      = EXCLUDED.longitude,
                    aqi            = EXCLUDED.aqi,
                    pm25           = EXCLUDED.pm25,
                    pm10           = EXCLUDED.pm10,
                    no2            = EXCLUDED.no2,
                    o3             = EXCLUDED.o3,
                    co             = EXCLUDED.co,
                    temperature    = EXCLUDED.temperature,
                    humidity       = EXCLUDED.humidity,
                    pressure       = EXCLUDED.pressure,
                    wind_speed     = EXCLUDED.wind_speed,
                    wind_direction = EXCLUDED.wind_direction,
                    visibility     = EXCLUDED.visibility,
                    created_at     = EXCLUDED.created_at",
            );
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_aggregates(&self, aggregates: &[HourlyAggregate]) -> Result<(), StoreError> {
        // ---
        for chunk in aggregates.chunks(CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO hourly_aggregates (
                    sensor_id, hour, location_name, avg_aqi, min_aqi, max_aqi,
                    avg_pm25, avg_pm10, avg_no2, avg_o3, avg_co, avg_temperature,
                    avg_humidity, avg_pressure, avg_wind_speed, reading_count,
                    aqi_category, health_status
                ) ",
            );
            builder.push_values(chunk.iter(), |mut b, a| {
                b.push_bind(&a.sensor_id)
                    .push_bind(a.hour)
                    .push_bind(&a.location_name)
                    .push_bind(a.avg_aqi)
                    .push_bind(a.min_aqi)
                    .push_bind(a.max_aqi)
                    .push_bind(a.avg_pm25)
                    .push_bind(a.avg_pm10)
                    .push_bind(a.avg_no2)
                    .push_bind(a.avg_o3)
                    .push_bind(a.avg_co)
                    .push_bind(a.avg_temperature)
                    .push_bind(a.avg_humidity)
                    .push_bind(a.avg_pressure)
                    .push_bind(a.avg_wind_speed)
                    .push_bind(i64::from(a.reading_count))
                    .push_bind(a.aqi_category.as_str())
                    .push_bind(a.health_status.as_str());
            });
            builder.push(
                " ON CONFLICT (sensor_id, hour) DO UPDATE SET
                    location_name   = EXCLUDED.location_name,
                    avg_aqi         = EXCLUDED.avg_aqi,
                    min_aqi         = EXCLUDED.min_aqi,
                    max_aqi         = EXCLUDED.max_aqi,
                    avg_pm25        = EXCLUDED.avg_pm25,
                    avg_pm10        = EXCLUDED.avg_pm10,
                    avg_no2         = EXCLUDED.avg_no2,
                    avg_o3          = EXCLUDED.avg_o3,
                    avg_co          = EXCLUDED.avg_co,
                    avg_temperature = EXCLUDED.avg_temperature,
                    avg_humidity    = EXCLUDED.avg_humidity,
                    avg_pressure    = EXCLUDED.avg_pressure,
                    avg_wind_speed  = EXCLUDED.avg_wind_speed,
                    reading_count   = EXCLUDED.reading_count,
                    aqi_category    = EXCLUDED.aqi_category,
                    health_status   = EXCLUDED.health_status",
            );
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<Reading>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT sensor_id, location_name, latitude, longitude, timestamp,
                   aqi, pm25, pm10, no2, o3, co, temperature, humidity,
                   pressure, wind_speed, wind_direction, visibility, created_at
            FROM air_quality_readings
            WHERE timestamp >= $1
            ORDER BY timestamp, sensor_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn sensor_aggregates(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, AggregateRow>(
            r#"
            SELECT sensor_id, hour, location_name, avg_aqi, min_aqi, max_aqi,
                   avg_pm25, avg_pm10, avg_no2, avg_o3, avg_co, avg_temperature,
                   avg_humidity, avg_pressure, avg_wind_speed, reading_count,
                   aqi_category
            FROM hourly_aggregates
            WHERE sensor_id = $1 AND hour >= $2 AND hour < $3
            ORDER BY hour
            "#,
        )
        .bind(sensor_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HourlyAggregate::try_from).collect()
    }

    async fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let readings = sqlx::query("DELETE FROM air_quality_readings WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let aggregates = sqlx::query("DELETE FROM hourly_aggregates WHERE hour < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(readings.rows_affected() + aggregates.rows_affected())
    }
}
