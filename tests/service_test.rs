//! Service-level tests: drive `AirQualityService` in-process with a manual
//! clock, the in-memory store and stub forecast models.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;

use airsense::cache::ManualClock;
use airsense::categorizer::{AqiCategory, HealthStatus};
use airsense::error::StoreError;
use airsense::forecast::{ForecastGateway, ForecastModel, ModelOutput};
use airsense::models::{HourlyAggregate, RawReading, Reading};
use airsense::service::ServiceOptions;
use airsense::store::{AggregateStore, MemoryStore};
use airsense::{AirQualityService, CoreError};

// ---

/// Forecast model that can be switched off and counts its calls.
struct StubModel {
    predicted_aqi: f64,
    delay: Duration,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StubModel {
    fn new(predicted_aqi: f64) -> Self {
        Self {
            predicted_aqi,
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ForecastModel for StubModel {
    async fn predict(&self, _sensor_id: &str, _hours_ahead: u32) -> anyhow::Result<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("model offline"));
        }
        Ok(ModelOutput {
            predicted_aqi: self.predicted_aqi,
            confidence: 0.8,
        })
    }
}

/// Memory store whose writes and reads can be made to fail, or whose next
/// aggregate write can be held back.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    slow_aggregate_write: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for FlakyStore {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn upsert_readings(&self, readings: &[Reading]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert_readings(readings).await
    }

    async fn upsert_aggregates(&self, aggregates: &[HourlyAggregate]) -> Result<(), StoreError> {
        self.check()?;
        if self.slow_aggregate_write.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.upsert_aggregates(aggregates).await
    }

    async fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<Reading>, StoreError> {
        self.check()?;
        self.inner.readings_since(since).await
    }

    async fn sensor_aggregates(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        self.check()?;
        self.inner.sensor_aggregates(sensor_id, from, to).await
    }

    async fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.evict_before(cutoff).await
    }
}

struct Harness {
    service: Arc<AirQualityService>,
    clock: Arc<ManualClock>,
    model: Arc<StubModel>,
    store: Arc<FlakyStore>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 26, 10, 40, 0).unwrap()
}

fn harness_with(model: StubModel) -> Harness {
    // ---
    let clock = Arc::new(ManualClock::new(t0()));
    let model = Arc::new(model);
    let store = Arc::new(FlakyStore::default());
    let gateway = ForecastGateway::new(model.clone(), Duration::from_millis(500));
    let service = Arc::new(AirQualityService::new(
        store.clone(),
        gateway,
        clock.clone(),
        ServiceOptions::default(),
    ));
    Harness {
        service,
        clock,
        model,
        store,
    }
}

fn harness() -> Harness {
    harness_with(StubModel::new(72.0))
}

fn reading(sensor: &str, city: &str, ts: DateTime<Utc>, aqi: f64) -> RawReading {
    // ---
    RawReading {
        sensor_id: sensor.to_string(),
        location_name: city.to_string(),
        latitude: 34.0522,
        longitude: -118.2437,
        timestamp: ts,
        aqi: Some(aqi),
        pm25: Some(aqi * 0.4),
        pm10: Some(aqi * 0.6),
        no2: Some(18.0),
        o3: Some(31.0),
        co: Some(0.4),
        temperature: Some(22.0),
        humidity: Some(48.0),
        pressure: Some(1012.0),
        wind_speed: Some(2.5),
        wind_direction: Some(270.0),
        visibility: Some(12.0),
        created_at: None,
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 26, hour, minute, 0).unwrap()
}

#[tokio::test]
async fn two_readings_in_one_hour_roll_up() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![
            reading("S1", "Los Angeles", at(10, 5), 45.0),
            reading("S1", "Los Angeles", at(10, 35), 65.0),
        ])
        .await
        .unwrap();

    let agg = h.service.hourly_aggregate("S1", at(10, 0)).unwrap();

    assert_eq!(agg.hour, at(10, 0));
    assert_eq!(agg.avg_aqi, 55.0);
    assert_eq!(agg.min_aqi, 45.0);
    assert_eq!(agg.max_aqi, 65.0);
    assert_eq!(agg.reading_count, 2);
    assert_eq!(agg.aqi_category, AqiCategory::Moderate);
    assert_eq!(agg.health_status, HealthStatus::Acceptable);
}

#[tokio::test]
async fn reingesting_a_batch_is_idempotent() {
    // ---
    let batch = vec![
        reading("S1", "Chicago", at(9, 10), 41.0),
        reading("S1", "Chicago", at(9, 50), 57.3),
        reading("S2", "Chicago", at(10, 1), 88.8),
        reading("S3", "Phoenix", at(10, 20), 133.3),
        reading("S1", "Chicago", at(10, 30), 12.1),
    ];

    let once = harness();
    once.service.ingest_batch(batch.clone()).await.unwrap();

    let twice = harness();
    twice.service.ingest_batch(batch.clone()).await.unwrap();
    let second = twice.service.ingest_batch(batch.clone()).await.unwrap();

    let mut reversed = batch.clone();
    reversed.reverse();
    let shuffled = harness();
    shuffled.service.ingest_batch(reversed).await.unwrap();

    assert_eq!(second.overwritten, 5);
    assert_eq!(once.service.aggregates(), twice.service.aggregates());
    assert_eq!(once.service.aggregates(), shuffled.service.aggregates());
    assert_eq!(once.service.aggregates().len(), 4);
    assert_eq!(twice.store.inner.reading_count(), 5);
}

#[tokio::test]
async fn out_of_range_values() {
    // ---
    let h = harness();
    let mut hot = reading("S1", "Phoenix", at(10, 10), 80.0);
    hot.temperature = Some(80.0);

    let report = h
        .service
        .ingest_batch(vec![reading("S1", "Phoenix", at(10, 5), 600.0), hot])
        .await
        .unwrap();

    assert_eq!(report.rejected_invalid_aqi, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(report.fields_nulled, 1);

    let agg = h.service.hourly_aggregate("S1", at(10, 0)).unwrap();
    assert_eq!(agg.reading_count, 1);
    assert_eq!(agg.avg_aqi, 80.0);
    assert_eq!(agg.avg_temperature, None);
    assert_eq!(agg.avg_pm25, Some(32.0));
    assert_eq!(agg.avg_humidity, Some(48.0));
}

#[tokio::test]
async fn stale_prediction_served_when_model_fails() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 30), 40.0)])
        .await
        .unwrap();

    let fresh = h.service.get_predictions("S1", 6).await.unwrap();
    assert!(!fresh.stale);
    assert_eq!(fresh.prediction.predicted_aqi, 72.0);
    assert_eq!(fresh.prediction.category, AqiCategory::Moderate);
    assert_eq!(fresh.generated_at, t0());

    // past the 11:00 refresh boundary
    h.clock.advance(ChronoDuration::minutes(25));
    h.model.failing.store(true, Ordering::SeqCst);

    let fallback = h.service.get_predictions("S1", 6).await.unwrap();
    assert!(fallback.stale);
    assert_eq!(fallback.prediction, fresh.prediction);
    assert_eq!(fallback.generated_at, t0());
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.service.status().cache.stale_served, 1);
}

#[tokio::test]
async fn prediction_failure_without_prior_value_surfaces() {
    // ---
    let h = harness();
    h.model.failing.store(true, Ordering::SeqCst);
    h.service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 30), 40.0)])
        .await
        .unwrap();

    let err = h.service.get_predictions("S1", 6).await.unwrap_err();
    assert!(matches!(err, CoreError::ForecastUnavailable(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_prediction_reads_share_one_model_call() {
    // ---
    let mut model = StubModel::new(33.0);
    model.delay = Duration::from_millis(100);
    let h = harness_with(model);
    h.service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 30), 40.0)])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            service.get_predictions("S1", 12).await
        }));
    }
    for handle in handles {
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.prediction.predicted_aqi, 33.0);
        assert_eq!(got.prediction.category, AqiCategory::Good);
    }

    assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_batches_persist_the_final_aggregate() {
    // ---
    let h = harness();
    h.store.slow_aggregate_write.store(true, Ordering::SeqCst);

    let first = {
        let service = h.service.clone();
        tokio::spawn(async move {
            service
                .ingest_batch(vec![reading("S1", "Denver", at(10, 5), 40.0)])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let service = h.service.clone();
        tokio::spawn(async move {
            service
                .ingest_batch(vec![reading("S1", "Denver", at(10, 35), 60.0)])
                .await
        })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let stored = h
        .store
        .inner
        .sensor_aggregates("S1", at(0, 0), at(23, 0))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].reading_count, 2);
    assert_eq!(stored[0].avg_aqi, 50.0);

    let history = h.service.get_historical("S1", 1).await.unwrap();
    assert_eq!(history, stored);
}

#[tokio::test]
async fn rankings_order_cities_deterministically() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![
            reading("H1", "Houston", at(9, 0), 68.0),
            reading("SD1", "San Diego", at(9, 30), 38.0),
            reading("C1", "Chicago", at(10, 0), 42.0),
            reading("C2", "Chicago", at(10, 5), 42.0),
            reading("P1", "Phoenix", at(10, 10), 42.0),
        ])
        .await
        .unwrap();

    let ranked = h.service.get_rankings().await.unwrap();
    let order: Vec<_> = ranked
        .iter()
        .map(|c| (c.rank, c.location_name.as_str()))
        .collect();

    assert_eq!(
        order,
        vec![
            (1, "San Diego"),
            (2, "Chicago"),
            (3, "Phoenix"),
            (4, "Houston")
        ]
    );
    assert_eq!(ranked[1].sensor_count, 2);
    assert_eq!(ranked[3].status_emoji, "🟡");
}

#[tokio::test]
async fn historical_is_oldest_first_and_falls_back_when_store_fails() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![
            reading("S1", "Chicago", at(10, 15), 50.0),
            reading("S1", "Chicago", at(8, 15), 30.0),
            reading("S1", "Chicago", at(9, 15), 40.0),
            reading("S2", "Chicago", at(9, 15), 90.0),
        ])
        .await
        .unwrap();

    let history = h.service.get_historical("S1", 1).await.unwrap();
    let hours: Vec<_> = history.iter().map(|a| a.hour).collect();
    assert_eq!(hours, vec![at(8, 0), at(9, 0), at(10, 0)]);

    // 1 day of history stays fresh for 60s
    h.clock.advance(ChronoDuration::seconds(61));
    h.store.failing.store(true, Ordering::SeqCst);

    let fallback = h.service.get_historical("S1", 1).await.unwrap();
    assert_eq!(fallback, history);

    let err = h.service.get_historical("S1", 2).await.unwrap_err();
    assert!(matches!(err, CoreError::Store(_)));
}

#[tokio::test]
async fn store_failure_fails_the_batch() {
    // ---
    let h = harness();
    h.store.failing.store(true, Ordering::SeqCst);

    let err = h
        .service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 15), 50.0)])
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Store(_)));
}

#[tokio::test]
async fn malformed_batch_is_schema_drift() {
    // ---
    let h = harness();

    let err = h
        .service
        .ingest_json(json!({"readings": "oops"}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SchemaDrift(_)));

    let ok = h
        .service
        .ingest_json(json!([{
            "sensor_id": "S1",
            "location_name": "Chicago",
            "latitude": 41.88,
            "longitude": -87.63,
            "timestamp": "2025-03-26T10:20:00Z",
            "aqi": 44.0
        }]))
        .await
        .unwrap();
    assert_eq!(ok.accepted, 1);

    let status = h.service.status();
    assert_eq!(status.ingest.schema_drift, 1);
    assert_eq!(status.ingest.batches, 1);
    assert_eq!(status.store, "flaky");
}

#[tokio::test]
async fn summary_is_cached_until_ttl_expires() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 30), 40.0)])
        .await
        .unwrap();
    let first = h.service.get_summary().await.unwrap();

    h.service
        .ingest_batch(vec![reading("S2", "Denver", at(10, 35), 60.0)])
        .await
        .unwrap();
    let cached = h.service.get_summary().await.unwrap();
    assert_eq!(cached, first);

    h.clock.advance(ChronoDuration::seconds(31));
    let refreshed = h.service.get_summary().await.unwrap();
    assert_eq!(refreshed.total_sensors, 2);
    assert_eq!(refreshed.cities_monitored, 2);
    assert_eq!(refreshed.average_aqi, 50.0);
}

#[tokio::test]
async fn forced_refresh_recomputes() {
    // ---
    let h = harness();
    h.service
        .ingest_batch(vec![reading("S1", "Chicago", at(10, 30), 40.0)])
        .await
        .unwrap();
    assert_eq!(h.service.get_rankings().await.unwrap().len(), 1);

    h.service
        .ingest_batch(vec![reading("S2", "Denver", at(10, 35), 60.0)])
        .await
        .unwrap();
    assert_eq!(h.service.get_rankings().await.unwrap().len(), 1);

    assert_eq!(h.service.refresh().await, 2);
    assert_eq!(h.service.get_rankings().await.unwrap().len(), 2);
}
