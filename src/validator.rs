//! Validation and deduplication of raw readings.
//!
//! Each bounded field is checked on its own: a field outside its range is
//! nulled and the rest of the reading survives. An invalid `aqi` drops the
//! whole reading. Dedup is by [`crate::models::DedupKey`]; the aggregator
//! and store both treat a repeated key as an overwrite.
//!
//! The validator also owns the per-sensor high watermark. A reading older
//! than its sensor's watermark by more than the retention window is
//! rejected as [`Rejection::TooStale`]; anything newer is accepted, in order
//! or not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::error::Rejection;
use crate::models::{RawReading, Reading};

// ---

const AQI_RANGE: (f64, f64) = (0.0, 500.0);
const PM25_RANGE: (f64, f64) = (0.0, 500.0);
const PM10_RANGE: (f64, f64) = (0.0, 1000.0);
const NO2_RANGE: (f64, f64) = (0.0, 2000.0);
const O3_RANGE: (f64, f64) = (0.0, 1000.0);
const CO_RANGE: (f64, f64) = (0.0, 100.0);
const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 60.0);
const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
// hPa
const PRESSURE_RANGE: (f64, f64) = (300.0, 1100.0);
const WIND_SPEED_RANGE: (f64, f64) = (0.0, 200.0);
const WIND_DIRECTION_RANGE: (f64, f64) = (0.0, 360.0);
const VISIBILITY_RANGE: (f64, f64) = (0.0, 1000.0);

/// Lock-free ingestion counters.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: AtomicU64,
    pub overwritten: AtomicU64,
    pub rejected_invalid_aqi: AtomicU64,
    pub rejected_too_stale: AtomicU64,
    pub fields_nulled: AtomicU64,
    pub batches: AtomicU64,
    pub schema_drift: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub accepted: u64,
    pub overwritten: u64,
    pub rejected_invalid_aqi: u64,
    pub rejected_too_stale: u64,
    pub fields_nulled: u64,
    pub batches: u64,
    pub schema_drift: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        // ---
        IngestStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            rejected_invalid_aqi: self.rejected_invalid_aqi.load(Ordering::Relaxed),
            rejected_too_stale: self.rejected_too_stale.load(Ordering::Relaxed),
            fields_nulled: self.fields_nulled.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            schema_drift: self.schema_drift.load(Ordering::Relaxed),
        }
    }
}

/// A reading that passed validation, and how many fields were nulled.
#[derive(Debug, Clone)]
pub struct Validated {
    pub reading: Reading,
    pub nulled: u32,
}

#[derive(Debug)]
pub struct Validator {
    retention: ChronoDuration,
    watermarks: RwLock<HashMap<String, DateTime<Utc>>>,
    stats: IngestStats,
}

impl Validator {
    pub fn new(retention: ChronoDuration) -> Self {
        // ---
        Self {
            retention,
            watermarks: RwLock::new(HashMap::new()),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn watermark(&self, sensor_id: &str) -> Option<DateTime<Utc>> {
        self.watermarks
            .read()
            .ok()
            .and_then(|map| map.get(sensor_id).copied())
    }

    /// Validate one raw reading, advancing the sensor watermark on success.
    ///
    /// `received_at` stamps `created_at` when the source did not provide one.
    pub fn validate(
        &self,
        raw: RawReading,
        received_at: DateTime<Utc>,
    ) -> Result<Validated, Rejection> {
        // ---
        let aqi = match raw.aqi.and_then(|v| within(v, AQI_RANGE)) {
            Some(aqi) => aqi,
            None => {
                self.stats
                    .rejected_invalid_aqi
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    sensor = %raw.sensor_id,
                    aqi = ?raw.aqi,
                    "rejected reading: invalid aqi"
                );
                return Err(Rejection::InvalidAqi);
            }
        };

        if let Some(watermark) = self.watermark(&raw.sensor_id) {
            if raw.timestamp < watermark - self.retention {
                self.stats.rejected_too_stale.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    sensor = %raw.sensor_id,
                    timestamp = %raw.timestamp,
                    watermark = %watermark,
                    "rejected reading: too stale"
                );
                return Err(Rejection::TooStale {
                    timestamp: raw.timestamp,
                    watermark,
                });
            }
        }

        let mut nulled = 0u32;
        let mut check = |value: Option<f64>, range: (f64, f64)| -> Option<f64> {
            let value = value?;
            let kept = within(value, range);
            if kept.is_none() {
                nulled += 1;
            }
            kept
        };

        let reading = Reading {
            sensor_id: raw.sensor_id,
            location_name: raw.location_name,
            latitude: raw.latitude,
            longitude: raw.longitude,
            timestamp: raw.timestamp,
            aqi,
            pm25: check(raw.pm25, PM25_RANGE),
            pm10: check(raw.pm10, PM10_RANGE),
            no2: check(raw.no2, NO2_RANGE),
            o3: check(raw.o3, O3_RANGE),
            co: check(raw.co, CO_RANGE),
            temperature: check(raw.temperature, TEMPERATURE_RANGE),
            humidity: check(raw.humidity, HUMIDITY_RANGE),
            pressure: check(raw.pressure, PRESSURE_RANGE),
            wind_speed: check(raw.wind_speed, WIND_SPEED_RANGE),
            wind_direction: check(raw.wind_direction, WIND_DIRECTION_RANGE),
            visibility: check(raw.visibility, VISIBILITY_RANGE),
            created_at: raw.created_at.unwrap_or(received_at),
        };

        if nulled > 0 {
            self.stats
                .fields_nulled
                .fetch_add(u64::from(nulled), Ordering::Relaxed);
            tracing::debug!(sensor = %reading.sensor_id, nulled, "nulled out-of-range fields");
        }

        self.advance_watermark(&reading.sensor_id, reading.timestamp);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        Ok(Validated { reading, nulled })
    }

    /// Drop watermarks of sensors not heard from since `cutoff`. Returns how
    /// many were dropped.
    pub fn forget_before(&self, cutoff: DateTime<Utc>) -> usize {
        // ---
        let mut map = self.watermarks.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, watermark| *watermark >= cutoff);
        before - map.len()
    }

    pub fn watermark_count(&self) -> usize {
        self.watermarks
            .read()
            .map(|map| map.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    fn advance_watermark(&self, sensor_id: &str, timestamp: DateTime<Utc>) {
        // ---
        if let Ok(mut map) = self.watermarks.write() {
            match map.get_mut(sensor_id) {
                Some(current) if *current >= timestamp => {}
                Some(current) => *current = timestamp,
                None => {
                    map.insert(sensor_id.to_string(), timestamp);
                }
            }
        }
    }
}

fn within(value: f64, (lo, hi): (f64, f64)) -> Option<f64> {
    if value.is_finite() && value >= lo && value <= hi {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn raw(sensor_id: &str, timestamp: DateTime<Utc>, aqi: f64) -> RawReading {
        // ---
        RawReading {
            sensor_id: sensor_id.to_string(),
            location_name: "Chicago".to_string(),
            latitude: 41.8781,
            longitude: -87.6298,
            timestamp,
            aqi: Some(aqi),
            pm25: Some(12.0),
            pm10: Some(20.0),
            no2: Some(15.0),
            o3: Some(30.0),
            co: Some(0.6),
            temperature: Some(21.5),
            humidity: Some(55.0),
            pressure: Some(1013.0),
            wind_speed: Some(3.2),
            wind_direction: Some(180.0),
            visibility: Some(10.0),
            created_at: None,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, hour, minute, 0).unwrap()
    }

    fn validator() -> Validator {
        Validator::new(ChronoDuration::days(7))
    }

    #[test]
    fn test_aqi_out_of_range_is_rejected() {
        // ---
        let v = validator();
        let result = v.validate(raw("S1", at(10, 0), 600.0), at(10, 0));

        assert_eq!(result.unwrap_err(), Rejection::InvalidAqi);
        assert_eq!(v.stats().snapshot().rejected_invalid_aqi, 1);
        assert_eq!(v.watermark("S1"), None);
    }

    #[test]
    fn test_missing_or_non_finite_aqi_is_rejected() {
        // ---
        let v = validator();
        let mut missing = raw("S1", at(10, 0), 10.0);
        missing.aqi = None;
        let nan = raw("S1", at(10, 5), f64::NAN);
        let negative = raw("S1", at(10, 6), -1.0);

        assert_eq!(v.validate(missing, at(10, 0)).unwrap_err(), Rejection::InvalidAqi);
        assert_eq!(v.validate(nan, at(10, 0)).unwrap_err(), Rejection::InvalidAqi);
        assert_eq!(v.validate(negative, at(10, 0)).unwrap_err(), Rejection::InvalidAqi);
    }

    #[test]
    fn test_out_of_range_temperature_is_nulled_only() {
        // ---
        let v = validator();
        let mut r = raw("S1", at(10, 0), 45.0);
        r.temperature = Some(80.0);

        let validated = v.validate(r, at(10, 0)).unwrap();

        assert_eq!(validated.nulled, 1);
        assert_eq!(validated.reading.temperature, None);
        assert_eq!(validated.reading.aqi, 45.0);
        assert_eq!(validated.reading.pm25, Some(12.0));
        assert_eq!(validated.reading.humidity, Some(55.0));
        assert_eq!(v.stats().snapshot().fields_nulled, 1);
    }

    #[test]
    fn test_boundary_values_are_kept() {
        // ---
        let v = validator();
        let mut r = raw("S1", at(10, 0), 500.0);
        r.pm25 = Some(500.0);
        r.temperature = Some(-50.0);

        let validated = v.validate(r, at(10, 0)).unwrap();

        assert_eq!(validated.nulled, 0);
        assert_eq!(validated.reading.aqi, 500.0);
        assert_eq!(validated.reading.temperature, Some(-50.0));
    }

    #[test]
    fn test_several_bad_fields_are_counted() {
        // ---
        let v = validator();
        let mut r = raw("S1", at(10, 0), 45.0);
        r.pm25 = Some(501.0);
        r.humidity = Some(120.0);
        r.wind_direction = Some(-3.0);

        let validated = v.validate(r, at(10, 0)).unwrap();

        assert_eq!(validated.nulled, 3);
        assert_eq!(validated.reading.pm25, None);
        assert_eq!(validated.reading.humidity, None);
        assert_eq!(validated.reading.wind_direction, None);
    }

    #[test]
    fn test_watermark_advances_and_bounds_staleness() {
        // ---
        let v = validator();
        let latest = at(10, 0);
        v.validate(raw("S1", latest, 40.0), latest).unwrap();
        assert_eq!(v.watermark("S1"), Some(latest));

        // out of order but inside the window
        let earlier = latest - ChronoDuration::days(6);
        assert!(v.validate(raw("S1", earlier, 40.0), latest).is_ok());
        assert_eq!(v.watermark("S1"), Some(latest));

        // beyond the window
        let ancient = latest - ChronoDuration::days(8);
        let err = v.validate(raw("S1", ancient, 40.0), latest).unwrap_err();
        assert_eq!(
            err,
            Rejection::TooStale {
                timestamp: ancient,
                watermark: latest
            }
        );

        // other sensors are unaffected
        assert!(v.validate(raw("S2", ancient, 40.0), latest).is_ok());
        assert_eq!(v.stats().snapshot().rejected_too_stale, 1);
    }

    #[test]
    fn test_implausible_magnitudes_are_nulled() {
        // ---
        let v = validator();
        let mut r = raw("S1", at(10, 0), 45.0);
        r.pm10 = Some(1e40);
        r.pressure = Some(1e300);
        r.wind_speed = Some(f64::INFINITY);
        r.visibility = Some(5000.0);
        r.co = Some(-0.1);

        let validated = v.validate(r, at(10, 0)).unwrap();

        assert_eq!(validated.nulled, 5);
        assert_eq!(validated.reading.pm10, None);
        assert_eq!(validated.reading.pressure, None);
        assert_eq!(validated.reading.wind_speed, None);
        assert_eq!(validated.reading.visibility, None);
        assert_eq!(validated.reading.co, None);
        assert_eq!(validated.reading.no2, Some(15.0));
    }

    #[test]
    fn test_forget_before_drops_silent_sensors() {
        // ---
        let v = validator();
        v.validate(raw("OLD", at(1, 0), 40.0), at(1, 0)).unwrap();
        v.validate(raw("NEW", at(11, 0), 40.0), at(11, 0)).unwrap();

        assert_eq!(v.forget_before(at(10, 0)), 1);
        assert_eq!(v.watermark("OLD"), None);
        assert_eq!(v.watermark("NEW"), Some(at(11, 0)));
        assert_eq!(v.watermark_count(), 1);
    }

    #[test]
    fn test_created_at_defaults_to_receive_time() {
        // ---
        let v = validator();
        let received = at(11, 30);
        let validated = v.validate(raw("S1", at(10, 0), 40.0), received).unwrap();

        assert_eq!(validated.reading.created_at, received);
    }
}
