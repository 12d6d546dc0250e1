//! Durable storage for raw readings and hourly aggregates.
//!
//! The core only needs upsert-by-key and range scans by time, so the store
//! is a small trait with an in-memory implementation (tests, single-node
//! runs without a database) and a PostgreSQL one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{HourlyAggregate, Reading};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Short name for status output.
    fn kind(&self) -> &'static str;

    /// Insert or fully replace readings, keyed by `(sensor_id, timestamp)`.
    async fn upsert_readings(&self, readings: &[Reading]) -> Result<(), StoreError>;

    /// Insert or fully replace aggregates, keyed by `(sensor_id, hour)`.
    async fn upsert_aggregates(&self, aggregates: &[HourlyAggregate]) -> Result<(), StoreError>;

    /// Readings with `timestamp >= since`, oldest first.
    async fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<Reading>, StoreError>;

    /// One sensor's aggregates with `from <= hour < to`, oldest first.
    async fn sensor_aggregates(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, StoreError>;

    /// Delete readings and aggregates older than `cutoff`. Returns rows removed.
    async fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
