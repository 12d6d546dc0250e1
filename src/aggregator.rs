//! Windowed hourly aggregation.
//!
//! Each `(sensor_id, hour)` bucket keeps the readings that fall into it plus
//! running sums. Sums are held in fixed-point micro-units so that adding and
//! removing a reading is exact: an overwrite subtracts the old contribution
//! and adds the new one, and the result does not depend on arrival order.
//! Min/max are rescanned from the bucket's readings when an overwrite
//! happens.
//!
//! Buckets sit behind their own mutex; the bucket map itself is behind a
//! reader-writer lock that is only taken for writing when a bucket is
//! created or evicted. Each bucket also carries an async persist gate: a
//! writer snapshots and stores a bucket only while holding its gate, so the
//! last row written for a bucket is always its newest state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::categorizer;
use crate::models::{DedupKey, HourlyAggregate, Reading};

// ---

const MICROS: f64 = 1_000_000.0;
// Largest magnitude summed exactly; u32::MAX of these still fits in i128.
const MAX_SUMMABLE: f64 = 1e15;
const HOUR_MS: i64 = 3_600_000;

/// Truncate a timestamp to the start of its hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    // ---
    let bucket_ms = ts.timestamp_millis().div_euclid(HOUR_MS) * HOUR_MS;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub sensor_id: String,
    pub hour: DateTime<Utc>,
}

impl BucketKey {
    pub fn of(reading: &Reading) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            hour: hour_bucket(reading.timestamp),
        }
    }
}

/// Exact, reversible sum of one optional field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldSum {
    micros: i128,
    count: u32,
}

impl FieldSum {
    fn add(&mut self, value: Option<f64>) {
        if let Some(m) = value.and_then(to_micros) {
            self.micros += m;
            self.count += 1;
        }
    }

    fn remove(&mut self, value: Option<f64>) {
        if let Some(m) = value.and_then(to_micros) {
            self.micros -= m;
            self.count = self.count.saturating_sub(1);
        }
    }

    fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.micros as f64 / f64::from(self.count) / MICROS)
    }
}

/// Fixed-point value, or `None` when it cannot be summed exactly. Add and
/// remove skip the same values, so the sums stay reversible.
fn to_micros(value: f64) -> Option<i128> {
    (value.is_finite() && value.abs() <= MAX_SUMMABLE).then(|| (value * MICROS).round() as i128)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BucketSums {
    aqi: FieldSum,
    pm25: FieldSum,
    pm10: FieldSum,
    no2: FieldSum,
    o3: FieldSum,
    co: FieldSum,
    temperature: FieldSum,
    humidity: FieldSum,
    pressure: FieldSum,
    wind_speed: FieldSum,
}

impl BucketSums {
    fn add(&mut self, r: &Reading) {
        // ---
        self.aqi.add(Some(r.aqi));
        self.pm25.add(r.pm25);
        self.pm10.add(r.pm10);
        self.no2.add(r.no2);
        self.o3.add(r.o3);
        self.co.add(r.co);
        self.temperature.add(r.temperature);
        self.humidity.add(r.humidity);
        self.pressure.add(r.pressure);
        self.wind_speed.add(r.wind_speed);
    }

    fn remove(&mut self, r: &Reading) {
        // ---
        self.aqi.remove(Some(r.aqi));
        self.pm25.remove(r.pm25);
        self.pm10.remove(r.pm10);
        self.no2.remove(r.no2);
        self.o3.remove(r.o3);
        self.co.remove(r.co);
        self.temperature.remove(r.temperature);
        self.humidity.remove(r.humidity);
        self.pressure.remove(r.pressure);
        self.wind_speed.remove(r.wind_speed);
    }
}

#[derive(Debug)]
struct HourBucket {
    key: BucketKey,
    location_name: String,
    readings: BTreeMap<DateTime<Utc>, Reading>,
    sums: BucketSums,
    min_aqi: f64,
    max_aqi: f64,
}

impl HourBucket {
    fn new(key: BucketKey) -> Self {
        Self {
            key,
            location_name: String::new(),
            readings: BTreeMap::new(),
            sums: BucketSums::default(),
            min_aqi: f64::INFINITY,
            max_aqi: f64::NEG_INFINITY,
        }
    }

    /// Insert or overwrite a reading. Returns true on overwrite.
    fn upsert(&mut self, reading: Reading) -> bool {
        // ---
        let aqi = reading.aqi;
        self.sums.add(&reading);
        let previous = self.readings.insert(reading.timestamp, reading);
        if let Some(latest) = self.readings.values().next_back() {
            self.location_name.clone_from(&latest.location_name);
        }

        match previous {
            Some(old) => {
                self.sums.remove(&old);
                self.rescan_extremes();
                true
            }
            None => {
                self.min_aqi = self.min_aqi.min(aqi);
                self.max_aqi = self.max_aqi.max(aqi);
                false
            }
        }
    }

    fn rescan_extremes(&mut self) {
        // ---
        let (min, max) = self
            .readings
            .values()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r.aqi), hi.max(r.aqi))
            });
        self.min_aqi = min;
        self.max_aqi = max;
    }

    fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Location comes from the latest reading in the bucket, so the result
    /// does not depend on arrival order.
    fn snapshot(&self) -> HourlyAggregate {
        // ---
        let avg_aqi = self.sums.aqi.mean().unwrap_or_default();

        HourlyAggregate {
            sensor_id: self.key.sensor_id.clone(),
            location_name: self.location_name.clone(),
            hour: self.key.hour,
            avg_aqi,
            min_aqi: self.min_aqi,
            max_aqi: self.max_aqi,
            avg_pm25: self.sums.pm25.mean(),
            avg_pm10: self.sums.pm10.mean(),
            avg_no2: self.sums.no2.mean(),
            avg_o3: self.sums.o3.mean(),
            avg_co: self.sums.co.mean(),
            avg_temperature: self.sums.temperature.mean(),
            avg_humidity: self.sums.humidity.mean(),
            avg_pressure: self.sums.pressure.mean(),
            avg_wind_speed: self.sums.wind_speed.mean(),
            reading_count: self.sums.aqi.count,
            aqi_category: categorizer::category(avg_aqi),
            health_status: categorizer::health_status(avg_aqi),
        }
    }
}

#[derive(Debug)]
struct BucketCell {
    state: Mutex<HourBucket>,
    persist: Arc<tokio::sync::Mutex<()>>,
}

impl BucketCell {
    fn new(key: BucketKey) -> Self {
        Self {
            state: Mutex::new(HourBucket::new(key)),
            persist: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HourBucket> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held while a set of buckets is written to the durable store.
pub struct PersistGuard {
    _gates: Vec<OwnedMutexGuard<()>>,
}

/// Result of folding one reading into its bucket.
#[derive(Debug, Clone)]
pub struct Applied {
    pub aggregate: HourlyAggregate,
    pub overwritten: bool,
}

#[derive(Debug)]
pub struct Aggregator {
    retention: ChronoDuration,
    buckets: RwLock<HashMap<BucketKey, Arc<BucketCell>>>,
}

impl Aggregator {
    pub fn new(retention: ChronoDuration) -> Self {
        // ---
        Self {
            retention,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    /// Fold a validated reading into its hour bucket.
    pub fn apply(&self, reading: Reading) -> Applied {
        // ---
        let key = BucketKey::of(&reading);
        let bucket = self.bucket(&key);
        let mut guard = bucket.lock();
        let overwritten = guard.upsert(reading);
        let aggregate = guard.snapshot();
        Applied {
            aggregate,
            overwritten,
        }
    }

    fn bucket(&self, key: &BucketKey) -> Arc<BucketCell> {
        // ---
        {
            let map = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = map.get(key) {
                return bucket.clone();
            }
        }
        let mut map = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(BucketCell::new(key.clone())))
            .clone()
    }

    fn collect<F>(&self, keep: F) -> Vec<HourlyAggregate>
    where
        F: Fn(&BucketKey) -> bool,
    {
        // ---
        let handles: Vec<Arc<BucketCell>> = {
            let map = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .filter(|(key, _)| keep(key))
                .map(|(_, bucket)| bucket.clone())
                .collect()
        };

        let mut out: Vec<HourlyAggregate> = handles
            .iter()
            .filter_map(|bucket| {
                let guard = bucket.lock();
                (!guard.is_empty()).then(|| guard.snapshot())
            })
            .collect();
        out.sort_by(|a, b| (&a.sensor_id, a.hour).cmp(&(&b.sensor_id, b.hour)));
        out
    }

    /// Current state of one bucket, if it holds any readings.
    pub fn get(&self, key: &BucketKey) -> Option<HourlyAggregate> {
        // ---
        let bucket = self
            .buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        let guard = bucket.lock();
        (!guard.is_empty()).then(|| guard.snapshot())
    }

    /// Current value of one reading, if its bucket still holds it.
    pub fn reading(&self, key: &DedupKey) -> Option<Reading> {
        // ---
        let bucket_key = BucketKey {
            sensor_id: key.sensor_id.clone(),
            hour: hour_bucket(key.timestamp),
        };
        let bucket = self
            .buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bucket_key)
            .cloned()?;
        let guard = bucket.lock();
        guard.readings.get(&key.timestamp).cloned()
    }

    /// Wait for exclusive persist rights on `keys`. Gates are taken in key
    /// order, so overlapping callers cannot deadlock.
    pub async fn persist_gate(&self, keys: &BTreeSet<BucketKey>) -> PersistGuard {
        // ---
        let mut gates = Vec::with_capacity(keys.len());
        for key in keys {
            let gate = self.bucket(key).persist.clone();
            gates.push(gate.lock_owned().await);
        }
        PersistGuard { _gates: gates }
    }

    /// Consistent per-bucket snapshot of every bucket starting at or after `since`.
    pub fn snapshot_since(&self, since: DateTime<Utc>) -> Vec<HourlyAggregate> {
        self.collect(|key| key.hour >= since)
    }

    /// Buckets of one sensor starting at or after `since`, oldest first.
    pub fn history(&self, sensor_id: &str, since: DateTime<Utc>) -> Vec<HourlyAggregate> {
        self.collect(|key| key.sensor_id == sensor_id && key.hour >= since)
    }

    /// Drop buckets whose hour is older than `now - retention`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        // ---
        let cutoff = now - self.retention;
        let mut map = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|key, _| key.hour >= cutoff);
        let evicted = before - map.len();
        if evicted > 0 {
            tracing::info!(evicted, cutoff = %cutoff, "evicted expired hour buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .map(|map| map.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::categorizer::{AqiCategory, HealthStatus};
    use crate::validator::tests::raw;
    use crate::validator::Validator;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, hour, minute, 0).unwrap()
    }

    fn reading(sensor_id: &str, ts: DateTime<Utc>, aqi: f64) -> Reading {
        // ---
        Validator::new(ChronoDuration::days(7))
            .validate(raw(sensor_id, ts, aqi), ts)
            .unwrap()
            .reading
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(ChronoDuration::days(7))
    }

    #[test]
    fn test_hour_bucket_truncates() {
        // ---
        assert_eq!(hour_bucket(at(10, 59)), at(10, 0));
        assert_eq!(hour_bucket(at(10, 0)), at(10, 0));
    }

    #[test]
    fn test_two_readings_same_hour() {
        // ---
        let agg = aggregator();
        agg.apply(reading("S1", at(10, 5), 45.0));
        let applied = agg.apply(reading("S1", at(10, 35), 65.0));

        let a = applied.aggregate;
        assert!(!applied.overwritten);
        assert_eq!(a.hour, at(10, 0));
        assert_eq!(a.avg_aqi, 55.0);
        assert_eq!(a.min_aqi, 45.0);
        assert_eq!(a.max_aqi, 65.0);
        assert_eq!(a.reading_count, 2);
        assert_eq!(a.aqi_category, AqiCategory::Moderate);
        assert_eq!(a.health_status, HealthStatus::Acceptable);
    }

    #[test]
    fn test_overwrite_replaces_contribution() {
        // ---
        let agg = aggregator();
        agg.apply(reading("S1", at(10, 5), 45.0));
        agg.apply(reading("S1", at(10, 35), 90.0));
        let applied = agg.apply(reading("S1", at(10, 35), 65.0));

        assert!(applied.overwritten);
        assert_eq!(applied.aggregate.reading_count, 2);
        assert_eq!(applied.aggregate.avg_aqi, 55.0);
        assert_eq!(applied.aggregate.max_aqi, 65.0);
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        // ---
        let batch = vec![
            reading("S1", at(10, 5), 45.1),
            reading("S1", at(10, 20), 0.3),
            reading("S1", at(11, 5), 77.7),
            reading("S2", at(10, 5), 12.9),
        ];

        let once = aggregator();
        for r in batch.clone() {
            once.apply(r);
        }
        let twice = aggregator();
        for r in batch.iter().chain(batch.iter()).rev() {
            twice.apply(r.clone());
        }

        assert_eq!(
            once.snapshot_since(at(0, 0)),
            twice.snapshot_since(at(0, 0))
        );
        assert_eq!(once.bucket_count(), 3);
    }

    #[test]
    fn test_null_fields_do_not_skew_means() {
        // ---
        let agg = aggregator();
        let mut first = reading("S1", at(10, 5), 40.0);
        first.temperature = None;
        let mut second = reading("S1", at(10, 10), 60.0);
        second.temperature = Some(20.0);
        agg.apply(first);
        let a = agg.apply(second).aggregate;

        assert_eq!(a.avg_temperature, Some(20.0));
        assert_eq!(a.reading_count, 2);
    }

    #[test]
    fn test_history_is_oldest_first_and_scoped() {
        // ---
        let agg = aggregator();
        agg.apply(reading("S1", at(12, 0), 30.0));
        agg.apply(reading("S1", at(9, 0), 30.0));
        agg.apply(reading("S2", at(10, 0), 30.0));
        agg.apply(reading("S1", at(11, 0), 30.0));

        let hours: Vec<_> = agg.history("S1", at(10, 0)).iter().map(|a| a.hour).collect();
        assert_eq!(hours, vec![at(11, 0), at(12, 0)]);
    }

    #[test]
    fn test_evict_expired() {
        // ---
        let agg = aggregator();
        let now = at(12, 0);
        agg.apply(reading("S1", now - ChronoDuration::days(8), 30.0));
        agg.apply(reading("S1", now - ChronoDuration::days(1), 30.0));

        assert_eq!(agg.evict_expired(now), 1);
        assert_eq!(agg.bucket_count(), 1);
    }

    #[test]
    fn test_huge_values_do_not_corrupt_sums() {
        // ---
        let agg = aggregator();
        let mut first = reading("S1", at(10, 5), 40.0);
        first.pressure = Some(1e300);
        first.pm10 = Some(1e40);
        let mut second = reading("S1", at(10, 10), 60.0);
        second.pressure = Some(1e300);
        agg.apply(first.clone());
        agg.apply(second);
        // overwrite removes what was added
        let a = agg.apply(first).aggregate;

        assert_eq!(a.reading_count, 2);
        assert_eq!(a.avg_aqi, 50.0);
        assert_eq!(a.avg_pressure, None);
        assert_eq!(a.avg_pm10, Some(20.0));
    }

    #[tokio::test]
    async fn test_persist_gate_serializes_writers() {
        // ---
        let agg = Arc::new(aggregator());
        agg.apply(reading("S1", at(10, 5), 40.0));
        let keys: BTreeSet<BucketKey> = [BucketKey {
            sensor_id: "S1".to_string(),
            hour: at(10, 0),
        }]
        .into_iter()
        .collect();

        let held = agg.persist_gate(&keys).await;
        let waiter = {
            let agg = agg.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                let _gate = agg.persist_gate(&keys).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_concurrent_writes_to_one_bucket() {
        // ---
        let agg = aggregator();
        let readings: Vec<Reading> = (0..60)
            .map(|minute| reading("S1", at(10, minute), f64::from(minute)))
            .collect();

        std::thread::scope(|scope| {
            for chunk in readings.chunks(15) {
                let agg = &agg;
                scope.spawn(move || {
                    for r in chunk {
                        agg.apply(r.clone());
                    }
                });
            }
        });

        let snapshot = agg.snapshot_since(at(0, 0));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].reading_count, 60);
        assert_eq!(snapshot[0].avg_aqi, 29.5);
        assert_eq!(snapshot[0].min_aqi, 0.0);
        assert_eq!(snapshot[0].max_aqi, 59.0);
    }
}
