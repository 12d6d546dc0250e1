//! Forecast gateway.
//!
//! The forecast model is an external capability behind [`ForecastModel`].
//! [`ForecastGateway`] puts a hard timeout around every call and turns any
//! failure into [`CoreError::ForecastUnavailable`]. The category attached to
//! a prediction is always derived locally from the predicted value.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::categorizer;
use crate::error::{CoreError, CoreResult};
use crate::models::{round1, Prediction};

// ---

/// What the model itself returns. Anything else it sends is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelOutput {
    pub predicted_aqi: f64,
    pub confidence: f64,
}

#[async_trait]
pub trait ForecastModel: Send + Sync {
    async fn predict(&self, sensor_id: &str, hours_ahead: u32) -> Result<ModelOutput>;
}

/// Model served over HTTP: `GET {base_url}/predict?sensor_id=..&hours_ahead=..`.
#[derive(Debug, Clone)]
pub struct HttpForecastModel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpForecastModel {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ForecastModel for HttpForecastModel {
    async fn predict(&self, sensor_id: &str, hours_ahead: u32) -> Result<ModelOutput> {
        // ---
        let url = format!("{}/predict", self.base_url.trim_end_matches('/'));
        let hours = hours_ahead.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("sensor_id", sensor_id), ("hours_ahead", hours.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ModelOutput>().await?)
    }
}

/// Stand-in used when no model endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoModel;

#[async_trait]
impl ForecastModel for NoModel {
    async fn predict(&self, _sensor_id: &str, _hours_ahead: u32) -> Result<ModelOutput> {
        Err(anyhow!("no forecast model configured"))
    }
}

#[derive(Debug, Default)]
pub struct ForecastStats {
    pub calls: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForecastStatsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Whether the most recent call succeeded. `None` before the first call.
    pub last_call_ok: Option<bool>,
}

#[derive(Clone)]
pub struct ForecastGateway {
    model: Arc<dyn ForecastModel>,
    timeout: Duration,
    stats: Arc<ForecastStats>,
    // 0 = no call yet, 1 = ok, 2 = failed
    last_outcome: Arc<AtomicU8>,
}

impl ForecastGateway {
    pub fn new(model: Arc<dyn ForecastModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            stats: Arc::new(ForecastStats::default()),
            last_outcome: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> ForecastStatsSnapshot {
        // ---
        ForecastStatsSnapshot {
            calls: self.stats.calls.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            last_call_ok: match self.last_outcome.load(Ordering::Relaxed) {
                0 => None,
                1 => Some(true),
                _ => Some(false),
            },
        }
    }

    fn record(&self, ok: bool) {
        if !ok {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_outcome
            .store(if ok { 1 } else { 2 }, Ordering::Relaxed);
    }

    /// Ask the model for a forecast. The call is dropped once the timeout
    /// elapses.
    pub async fn predict(&self, sensor_id: &str, hours_ahead: u32) -> CoreResult<Prediction> {
        // ---
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let call = self.model.predict(sensor_id, hours_ahead);
        let output = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.record(false);
                tracing::warn!(
                    sensor = sensor_id,
                    hours_ahead,
                    error = %err,
                    "forecast model failed"
                );
                return Err(CoreError::ForecastUnavailable(err.to_string()));
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.record(false);
                tracing::warn!(
                    sensor = sensor_id,
                    hours_ahead,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "forecast model timed out"
                );
                return Err(CoreError::ForecastUnavailable(format!(
                    "timed out after {} ms",
                    self.timeout.as_millis()
                )));
            }
        };

        if !output.predicted_aqi.is_finite() || !output.confidence.is_finite() {
            self.record(false);
            return Err(CoreError::ForecastUnavailable(
                "model returned a non-finite value".to_string(),
            ));
        }

        self.record(true);
        let predicted_aqi = round1(output.predicted_aqi.clamp(0.0, 500.0));
        Ok(Prediction {
            sensor_id: sensor_id.to_string(),
            hours_ahead,
            predicted_aqi,
            category: categorizer::category(predicted_aqi),
            confidence: output.confidence.clamp(0.0, 1.0),
        })
    }
}
