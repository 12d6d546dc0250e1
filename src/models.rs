//! Data models for the air quality pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::categorizer::{AqiCategory, HealthStatus};

// ---

/// Raw sensor reading as delivered by the ingestion source.
///
/// Every measurement is optional on the wire; identity and position are not.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawReading {
    // ---
    pub sensor_id: String,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub aqi: Option<f64>,
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
    #[serde(default)]
    pub co: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub visibility: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Validated reading. `aqi` is always present and in range; any other
/// field that failed its bound has been nulled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub sensor_id: String,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub aqi: f64,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    pub co: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub visibility: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Dedup key of a reading: sensor id plus exact timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
}

impl RawReading {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            sensor_id: self.sensor_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl Reading {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            sensor_id: self.sensor_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Stored readings go back through the validator on restart.
impl From<Reading> for RawReading {
    fn from(r: Reading) -> Self {
        // ---
        RawReading {
            sensor_id: r.sensor_id,
            location_name: r.location_name,
            latitude: r.latitude,
            longitude: r.longitude,
            timestamp: r.timestamp,
            aqi: Some(r.aqi),
            pm25: r.pm25,
            pm10: r.pm10,
            no2: r.no2,
            o3: r.o3,
            co: r.co,
            temperature: r.temperature,
            humidity: r.humidity,
            pressure: r.pressure,
            wind_speed: r.wind_speed,
            wind_direction: r.wind_direction,
            visibility: r.visibility,
            created_at: Some(r.created_at),
        }
    }
}

/// One hour of one sensor, rolled up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    // ---
    pub sensor_id: String,
    pub location_name: String,
    pub hour: DateTime<Utc>,
    pub avg_aqi: f64,
    pub min_aqi: f64,
    pub max_aqi: f64,
    pub avg_pm25: Option<f64>,
    pub avg_pm10: Option<f64>,
    pub avg_no2: Option<f64>,
    pub avg_o3: Option<f64>,
    pub avg_co: Option<f64>,
    pub avg_temperature: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub avg_pressure: Option<f64>,
    pub avg_wind_speed: Option<f64>,
    pub reading_count: u32,
    pub aqi_category: AqiCategory,
    pub health_status: HealthStatus,
}

/// City level state derived from the trailing day of aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRanking {
    // ---
    pub location_name: String,
    pub current_aqi: f64,
    pub current_pm25: Option<f64>,
    pub sensor_count: u32,
    pub last_updated: DateTime<Utc>,
    pub rank: u32,
    pub category: AqiCategory,
    pub status_emoji: String,
}

/// Forecast for one sensor, with the category derived locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    // ---
    pub sensor_id: String,
    pub hours_ahead: u32,
    pub predicted_aqi: f64,
    pub category: AqiCategory,
    pub confidence: f64,
}

/// Prediction as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    // ---
    #[serde(flatten)]
    pub prediction: Prediction,
    pub generated_at: DateTime<Utc>,
    pub stale: bool,
}

/// Platform wide statistics over the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    // ---
    pub total_sensors: u32,
    pub cities_monitored: u32,
    pub average_aqi: f64,
    pub good_quality_locations: u32,
    pub concerning_locations: u32,
    pub daily_predictions: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub sensor_id: String,
    pub location_name: String,
    pub aqi: f64,
    pub category: AqiCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorState {
    Active,
    Silent,
}

/// Directory entry for a known sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    // ---
    pub sensor_id: String,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub current_aqi: f64,
    pub last_updated: DateTime<Utc>,
    pub status: SensorState,
}

/// Outcome of ingesting one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    // ---
    pub batch_id: String,
    pub received: u32,
    pub accepted: u32,
    pub overwritten: u32,
    pub rejected_invalid_aqi: u32,
    pub rejected_too_stale: u32,
    pub fields_nulled: u32,
}

/// Round to one decimal place for presentation.
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raw_reading_accepts_missing_measurements() {
        // ---
        let json = r#"{
            "sensor_id": "S1",
            "location_name": "Chicago",
            "latitude": 41.8781,
            "longitude": -87.6298,
            "timestamp": "2025-03-26T18:45:00Z",
            "aqi": 42
        }"#;
        let raw: RawReading = serde_json::from_str(json).unwrap();

        assert_eq!(raw.aqi, Some(42.0));
        assert_eq!(raw.pm25, None);
        assert_eq!(raw.created_at, None);
        assert_eq!(
            raw.dedup_key(),
            DedupKey {
                sensor_id: "S1".to_string(),
                timestamp: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
            }
        );
    }

    #[test]
    fn test_prediction_response_flattens() {
        // ---
        let resp = PredictionResponse {
            prediction: Prediction {
                sensor_id: "S1".to_string(),
                hours_ahead: 6,
                predicted_aqi: 45.2,
                category: AqiCategory::Good,
                confidence: 0.85,
            },
            generated_at: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            stale: true,
        };
        let value = serde_json::to_value(&resp).unwrap();

        assert_eq!(value["predicted_aqi"], 45.2);
        assert_eq!(value["category"], "good");
        assert_eq!(value["stale"], true);
    }

    #[test]
    fn test_round1() {
        // ---
        assert_eq!(round1(55.04), 55.0);
        assert_eq!(round1(55.06), 55.1);
        assert_eq!(round1(12.0), 12.0);
    }
}
