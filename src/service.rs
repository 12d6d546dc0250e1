//! The core facade.
//!
//! [`AirQualityService`] wires validation, aggregation, ranking, caching and
//! forecasting together and exposes the read and ingest operations the HTTP
//! layer calls. Every read path goes through a [`CacheManager`]; only alerts,
//! the sensor directory and status are computed on each call.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::aggregator::{hour_bucket, Aggregator, BucketKey};
use crate::cache::{CacheKey, CacheManager, CacheStats, CacheStatsSnapshot, Clock, TtlPolicy};
use crate::categorizer::{self, AqiCategory, HealthStatus};
use crate::error::{CoreError, CoreResult, Rejection, StoreError};
use crate::forecast::{ForecastGateway, ForecastStatsSnapshot};
use crate::models::{
    round1, Alert, CityRanking, DedupKey, HourlyAggregate, IngestReport, Prediction,
    PredictionResponse, RawReading, Reading, SensorInfo, SensorState, Summary,
};
use crate::ranker::{self, RANKING_WINDOW_HOURS};
use crate::source;
use crate::store::AggregateStore;
use crate::validator::{IngestStatsSnapshot, Validator};

// ---

/// A sensor is current if its latest reading is at most this old.
pub const CURRENT_WINDOW_MINUTES: i64 = 60;
pub const MAX_HOURS_AHEAD: u32 = 168;
pub const MAX_HISTORY_DAYS: u32 = 30;

// Forecasts are refreshed every 15 minutes per sensor.
const DAILY_PREDICTIONS_PER_SENSOR: u64 = 24 * 4;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub retention: ChronoDuration,
    pub ttl: TtlPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            retention: ChronoDuration::days(7),
            ttl: TtlPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub generated_at: DateTime<Utc>,
    pub store: &'static str,
    pub known_sensors: usize,
    pub active_sensors: usize,
    pub live_buckets: usize,
    pub cache_entries: usize,
    pub ingest: IngestStatsSnapshot,
    pub cache: CacheStatsSnapshot,
    pub forecast: ForecastStatsSnapshot,
    pub forecast_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub buckets_evicted: usize,
    pub sensors_forgotten: usize,
    pub watermarks_forgotten: usize,
    pub cache_entries_swept: usize,
    pub cities_ranked: usize,
    pub rows_evicted: u64,
}

pub struct AirQualityService {
    clock: Arc<dyn Clock>,
    validator: Validator,
    aggregator: Aggregator,
    store: Arc<dyn AggregateStore>,
    gateway: ForecastGateway,
    latest: RwLock<HashMap<String, Reading>>,
    cache_stats: Arc<CacheStats>,
    current: CacheManager<Vec<Reading>>,
    summary: CacheManager<Summary>,
    rankings: CacheManager<Vec<CityRanking>>,
    predictions: CacheManager<Prediction>,
    historical: CacheManager<Vec<HourlyAggregate>>,
}

impl AirQualityService {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        gateway: ForecastGateway,
        clock: Arc<dyn Clock>,
        options: ServiceOptions,
    ) -> Self {
        // ---
        let stats = Arc::new(CacheStats::default());
        let ttl = &options.ttl;

        Self {
            validator: Validator::new(options.retention),
            aggregator: Aggregator::new(options.retention),
            store,
            gateway,
            latest: RwLock::new(HashMap::new()),
            current: cache(&clock, ttl, &stats),
            summary: cache(&clock, ttl, &stats),
            rankings: cache(&clock, ttl, &stats),
            predictions: cache(&clock, ttl, &stats),
            historical: cache(&clock, ttl, &stats),
            cache_stats: stats,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- ingest

    /// Validate, aggregate and persist one batch.
    ///
    /// Rejected readings are counted in the report and never fail the batch.
    /// A repeated `(sensor_id, timestamp)` overwrites the earlier reading,
    /// within the batch or across batches.
    pub async fn ingest_batch(&self, batch: Vec<RawReading>) -> CoreResult<IngestReport> {
        // ---
        let received_at = self.clock.now();
        let mut report = IngestReport {
            batch_id: Uuid::new_v4().to_string(),
            received: batch.len() as u32,
            ..IngestReport::default()
        };

        let mut accepted: BTreeSet<DedupKey> = BTreeSet::new();
        let mut touched: BTreeSet<BucketKey> = BTreeSet::new();

        for raw in batch {
            match self.validator.validate(raw, received_at) {
                Ok(validated) => {
                    report.fields_nulled += validated.nulled;
                    let reading = validated.reading;
                    touched.insert(BucketKey::of(&reading));
                    self.remember_latest(&reading);
                    let key = reading.dedup_key();
                    if self.aggregator.apply(reading).overwritten {
                        report.overwritten += 1;
                    }
                    accepted.insert(key);
                }
                Err(Rejection::InvalidAqi) => report.rejected_invalid_aqi += 1,
                Err(Rejection::TooStale { .. }) => report.rejected_too_stale += 1,
            }
        }
        report.accepted = report.received - report.rejected_invalid_aqi - report.rejected_too_stale;

        let stats = self.validator.stats();
        stats.batches.fetch_add(1, Ordering::Relaxed);
        stats
            .overwritten
            .fetch_add(u64::from(report.overwritten), Ordering::Relaxed);

        // Snapshot under the persist gate: a concurrent batch on the same
        // bucket either writes before us or sees our readings in its own
        // snapshot.
        let gate = self.aggregator.persist_gate(&touched).await;
        let readings: Vec<Reading> = accepted
            .iter()
            .filter_map(|key| self.aggregator.reading(key))
            .collect();
        let aggregates: Vec<HourlyAggregate> = touched
            .iter()
            .filter_map(|key| self.aggregator.get(key))
            .collect();
        self.persist(&readings, &aggregates).await?;
        drop(gate);

        tracing::info!(
            batch_id = %report.batch_id,
            received = report.received,
            accepted = report.accepted,
            overwritten = report.overwritten,
            rejected_invalid_aqi = report.rejected_invalid_aqi,
            rejected_too_stale = report.rejected_too_stale,
            fields_nulled = report.fields_nulled,
            "ingested batch"
        );
        Ok(report)
    }

    /// Shape-check a JSON batch, then ingest it.
    pub async fn ingest_json(&self, batch: Value) -> CoreResult<IngestReport> {
        // ---
        match source::parse_batch(batch) {
            Ok(readings) => self.ingest_batch(readings).await,
            Err(err) => {
                self.record_schema_drift(&err);
                Err(err)
            }
        }
    }

    pub fn record_schema_drift(&self, err: &CoreError) {
        // ---
        self.validator
            .stats()
            .schema_drift
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %err, "rejected incoming batch");
    }

    async fn persist(
        &self,
        readings: &[Reading],
        aggregates: &[HourlyAggregate],
    ) -> CoreResult<()> {
        // ---
        if readings.is_empty() {
            return Ok(());
        }
        let result: Result<(), StoreError> = async {
            self.store.upsert_readings(readings).await?;
            self.store.upsert_aggregates(aggregates).await
        }
        .await;

        if let Err(ref err) = result {
            tracing::error!(
                store = self.store.kind(),
                error = %err,
                readings = readings.len(),
                "failed to persist batch"
            );
        }
        Ok(result?)
    }

    fn remember_latest(&self, reading: &Reading) {
        // ---
        let mut map = self.latest.write().unwrap_or_else(|e| e.into_inner());
        match map.get(&reading.sensor_id) {
            Some(current) if current.timestamp > reading.timestamp => {}
            _ => {
                map.insert(reading.sensor_id.clone(), reading.clone());
            }
        }
    }

    fn is_known(&self, sensor_id: &str) -> bool {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(sensor_id)
    }

    /// Rebuild in-memory state from readings the store still retains.
    /// Nothing is written back.
    pub async fn restore(&self) -> CoreResult<usize> {
        // ---
        let now = self.clock.now();
        let since = now - self.aggregator.retention();
        let stored = self.store.readings_since(since).await?;
        let total = stored.len();

        let mut restored = 0;
        for reading in stored {
            if let Ok(validated) = self.validator.validate(reading.into(), now) {
                self.remember_latest(&validated.reading);
                self.aggregator.apply(validated.reading);
                restored += 1;
            }
        }

        let cities = self.refresh_rankings().await;
        tracing::info!(
            store = self.store.kind(),
            restored,
            skipped = total - restored,
            buckets = self.aggregator.bucket_count(),
            cities,
            "restored state from store"
        );
        Ok(restored)
    }

    // --- reads

    /// Latest reading of every sensor heard from in the last hour, ordered by
    /// sensor id. `city` is a case-insensitive substring of `location_name`.
    pub async fn get_current(&self, city: Option<&str>) -> CoreResult<Vec<Reading>> {
        // ---
        let city = city.map(str::trim).filter(|c| !c.is_empty());
        let key = CacheKey::Current(city.map(str::to_string));
        let cached = self
            .current
            .get_or_compute(&key, || async { Ok(self.current_snapshot(city)) })
            .await?;
        Ok(cached.value)
    }

    fn current_snapshot(&self, city: Option<&str>) -> Vec<Reading> {
        // ---
        let since = self.clock.now() - ChronoDuration::minutes(CURRENT_WINDOW_MINUTES);
        let needle = city.map(str::to_lowercase);
        let map = self.latest.read().unwrap_or_else(|e| e.into_inner());

        let mut out: Vec<Reading> = map
            .values()
            .filter(|r| r.timestamp >= since)
            .filter(|r| {
                needle
                    .as_ref()
                    .map_or(true, |n| r.location_name.to_lowercase().contains(n))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        out
    }

    pub async fn get_summary(&self) -> CoreResult<Summary> {
        // ---
        let cached = self
            .summary
            .get_or_compute(&CacheKey::Summary, || async { self.compute_summary() })
            .await?;
        Ok(cached.value)
    }

    fn compute_summary(&self) -> CoreResult<Summary> {
        // ---
        let readings = self.current_snapshot(None);
        let last_updated = readings
            .iter()
            .map(|r| r.timestamp)
            .max()
            .ok_or(CoreError::NoData)?;

        let total = readings.len();
        let cities: BTreeSet<&str> = readings.iter().map(|r| r.location_name.as_str()).collect();
        let aqi_sum: f64 = readings.iter().map(|r| r.aqi).sum();
        let good = readings
            .iter()
            .filter(|r| categorizer::category(r.aqi) == AqiCategory::Good)
            .count();
        let concerning = readings
            .iter()
            .filter(|r| categorizer::health_status(r.aqi) == HealthStatus::Concerning)
            .count();

        Ok(Summary {
            total_sensors: total as u32,
            cities_monitored: cities.len() as u32,
            average_aqi: round1(aqi_sum / total as f64),
            good_quality_locations: good as u32,
            concerning_locations: concerning as u32,
            daily_predictions: total as u64 * DAILY_PREDICTIONS_PER_SENSOR,
            last_updated,
        })
    }

    pub async fn get_rankings(&self) -> CoreResult<Vec<CityRanking>> {
        // ---
        let cached = self
            .rankings
            .get_or_compute(&CacheKey::Rankings, || async { Ok(self.compute_rankings()) })
            .await?;
        Ok(cached.value)
    }

    fn compute_rankings(&self) -> Vec<CityRanking> {
        // ---
        let now = self.clock.now();
        let since = hour_bucket(now - ChronoDuration::hours(RANKING_WINDOW_HOURS));
        ranker::rank_cities(&self.aggregator.snapshot_since(since), now)
    }

    /// Recompute rankings and install them in the cache. Returns the number
    /// of cities ranked.
    pub async fn refresh_rankings(&self) -> usize {
        // ---
        let rankings = self.compute_rankings();
        let cities = rankings.len();
        self.rankings.put(&CacheKey::Rankings, rankings).await;
        cities
    }

    /// Forecast for one sensor. A failed refresh falls back to the last good
    /// prediction, flagged `stale`.
    pub async fn get_predictions(
        &self,
        sensor_id: &str,
        hours_ahead: u32,
    ) -> CoreResult<PredictionResponse> {
        // ---
        if !(1..=MAX_HOURS_AHEAD).contains(&hours_ahead) {
            return Err(CoreError::InvalidRequest(format!(
                "hours_ahead must be between 1 and {}",
                MAX_HOURS_AHEAD
            )));
        }
        if !self.is_known(sensor_id) {
            return Err(CoreError::UnknownSensor(sensor_id.to_string()));
        }

        let key = CacheKey::Prediction {
            sensor_id: sensor_id.to_string(),
            hours_ahead,
        };
        let gateway = &self.gateway;
        let cached = self
            .predictions
            .get_or_compute(&key, || gateway.predict(sensor_id, hours_ahead))
            .await?;

        Ok(PredictionResponse {
            prediction: cached.value,
            generated_at: cached.fetched_at,
            stale: cached.stale,
        })
    }

    /// Hourly aggregates of one sensor over the last `days`, oldest first,
    /// read from the durable store.
    pub async fn get_historical(
        &self,
        sensor_id: &str,
        days: u32,
    ) -> CoreResult<Vec<HourlyAggregate>> {
        // ---
        if !(1..=MAX_HISTORY_DAYS).contains(&days) {
            return Err(CoreError::InvalidRequest(format!(
                "days must be between 1 and {}",
                MAX_HISTORY_DAYS
            )));
        }
        if !self.is_known(sensor_id) {
            return Err(CoreError::UnknownSensor(sensor_id.to_string()));
        }

        let key = CacheKey::Historical {
            sensor_id: sensor_id.to_string(),
            days,
        };
        let cached = self
            .historical
            .get_or_compute(&key, || async {
                let now = self.clock.now();
                let from = hour_bucket(now - ChronoDuration::days(i64::from(days)));
                let to = hour_bucket(now) + ChronoDuration::hours(1);
                Ok::<_, CoreError>(self.store.sensor_aggregates(sensor_id, from, to).await?)
            })
            .await?;
        Ok(cached.value)
    }

    /// Current readings above the acceptable level, worst first.
    pub fn get_alerts(&self) -> Vec<Alert> {
        // ---
        let mut alerts: Vec<Alert> = self
            .current_snapshot(None)
            .into_iter()
            .filter(|r| categorizer::health_status(r.aqi) == HealthStatus::Concerning)
            .map(|r| {
                let category = categorizer::category(r.aqi);
                Alert {
                    message: format!(
                        "{} air quality at {} (AQI {:.0})",
                        category.label(),
                        r.location_name,
                        r.aqi
                    ),
                    category,
                    sensor_id: r.sensor_id,
                    location_name: r.location_name,
                    aqi: r.aqi,
                    timestamp: r.timestamp,
                }
            })
            .collect();
        alerts.sort_by(|a, b| {
            b.aqi
                .total_cmp(&a.aqi)
                .then_with(|| a.sensor_id.cmp(&b.sensor_id))
        });
        alerts
    }

    /// Every sensor seen within the retention window.
    pub fn get_sensors(&self) -> Vec<SensorInfo> {
        // ---
        let since = self.clock.now() - ChronoDuration::minutes(CURRENT_WINDOW_MINUTES);
        let map = self.latest.read().unwrap_or_else(|e| e.into_inner());
        let mut sensors: Vec<SensorInfo> = map
            .values()
            .map(|r| SensorInfo {
                sensor_id: r.sensor_id.clone(),
                location_name: r.location_name.clone(),
                latitude: r.latitude,
                longitude: r.longitude,
                current_aqi: r.aqi,
                last_updated: r.timestamp,
                status: if r.timestamp >= since {
                    SensorState::Active
                } else {
                    SensorState::Silent
                },
            })
            .collect();
        sensors.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        sensors
    }

    /// Current state of one hour bucket.
    pub fn hourly_aggregate(
        &self,
        sensor_id: &str,
        hour: DateTime<Utc>,
    ) -> Option<HourlyAggregate> {
        self.aggregator.get(&BucketKey {
            sensor_id: sensor_id.to_string(),
            hour: hour_bucket(hour),
        })
    }

    /// Every live bucket, ordered by sensor then hour.
    pub fn aggregates(&self) -> Vec<HourlyAggregate> {
        self.aggregator.snapshot_since(DateTime::<Utc>::MIN_UTC)
    }

    // --- operations

    pub fn status(&self) -> SystemStatus {
        // ---
        let sensors = self.get_sensors();
        let active = sensors
            .iter()
            .filter(|s| s.status == SensorState::Active)
            .count();

        SystemStatus {
            generated_at: self.clock.now(),
            store: self.store.kind(),
            known_sensors: sensors.len(),
            active_sensors: active,
            live_buckets: self.aggregator.bucket_count(),
            cache_entries: self.current.len()
                + self.summary.len()
                + self.rankings.len()
                + self.predictions.len()
                + self.historical.len(),
            ingest: self.validator.stats().snapshot(),
            cache: self.cache_stats.snapshot(),
            forecast: self.gateway.stats(),
            forecast_timeout_ms: self.gateway.timeout().as_millis() as u64,
        }
    }

    /// Mark every cached result stale and recompute rankings now. Stale
    /// values remain as fallback.
    pub async fn refresh(&self) -> usize {
        // ---
        self.current.expire_all();
        self.summary.expire_all();
        self.rankings.expire_all();
        self.predictions.expire_all();
        self.historical.expire_all();
        let cities = self.refresh_rankings().await;
        tracing::info!(cities, "forced refresh of cached results");
        cities
    }

    /// Periodic housekeeping: evict expired buckets and sensors, sweep long
    /// stale cache entries, refresh rankings, then trim the store.
    pub async fn maintenance(&self) -> CoreResult<MaintenanceReport> {
        // ---
        let now = self.clock.now();
        let cutoff = now - self.aggregator.retention();

        let buckets_evicted = self.aggregator.evict_expired(now);
        let sensors_forgotten = {
            let mut map = self.latest.write().unwrap_or_else(|e| e.into_inner());
            let before = map.len();
            map.retain(|_, r| r.timestamp >= cutoff);
            before - map.len()
        };
        let watermarks_forgotten = self.validator.forget_before(cutoff);
        let cache_entries_swept = self.current.sweep()
            + self.summary.sweep()
            + self.rankings.sweep()
            + self.predictions.sweep()
            + self.historical.sweep();
        let cities_ranked = self.refresh_rankings().await;

        let rows_evicted = self.store.evict_before(cutoff).await.map_err(|err| {
            tracing::error!(
                store = self.store.kind(),
                error = %err,
                "failed to evict expired rows"
            );
            err
        })?;

        let report = MaintenanceReport {
            buckets_evicted,
            sensors_forgotten,
            watermarks_forgotten,
            cache_entries_swept,
            cities_ranked,
            rows_evicted,
        };
        tracing::info!(?report, "maintenance pass complete");
        Ok(report)
    }
}

fn cache<V>(clock: &Arc<dyn Clock>, ttl: &TtlPolicy, stats: &Arc<CacheStats>) -> CacheManager<V>
where
    V: Clone + Send + Sync,
{
    CacheManager::new(clock.clone(), ttl.clone(), stats.clone())
}
