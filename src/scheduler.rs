//! Background tasks: periodic maintenance and source polling.
//!
//! Both loops stop when the shared [`CancellationToken`] is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::service::AirQualityService;
use crate::source::SensorSource;

// ---

/// Refresh rankings, evict expired buckets and sweep caches on a fixed cadence.
pub fn spawn_maintenance(
    service: Arc<AirQualityService>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = service.maintenance().await {
                        tracing::warn!(error = %err, "maintenance pass failed");
                    }
                }
            }
        }
        tracing::debug!("maintenance task stopped");
    })
}

/// Pull the upstream source on a fixed cadence and ingest whatever it returns.
pub fn spawn_poller(
    service: Arc<AirQualityService>,
    source: SensorSource,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => poll_once(&service, &source).await,
            }
        }
        tracing::debug!("source poller stopped");
    })
}

async fn poll_once(service: &AirQualityService, source: &SensorSource) {
    // ---
    let batch = match source.fetch().await {
        Ok(batch) => batch,
        Err(err) => {
            match err.downcast_ref::<CoreError>() {
                Some(drift @ CoreError::SchemaDrift(_)) => service.record_schema_drift(drift),
                _ => tracing::warn!(error = %err, "source fetch failed"),
            }
            return;
        }
    };

    if batch.is_empty() {
        tracing::debug!("source returned no readings");
        return;
    }
    if let Err(err) = service.ingest_batch(batch).await {
        tracing::warn!(error = %err, "failed to ingest polled batch");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::cache::SystemClock;
    use crate::forecast::{ForecastGateway, NoModel};
    use crate::service::ServiceOptions;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_maintenance_task_stops_on_cancel() {
        // ---
        let service = Arc::new(AirQualityService::new(
            Arc::new(MemoryStore::new()),
            ForecastGateway::new(Arc::new(NoModel), Duration::from_millis(50)),
            Arc::new(SystemClock),
            ServiceOptions::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_maintenance(service, Duration::from_secs(1), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
