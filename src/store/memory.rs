use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::AggregateStore;
use crate::error::StoreError;
use crate::models::{DedupKey, HourlyAggregate, Reading};

// ---

/// Process-local store. Loses everything on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<BTreeMap<DedupKey, Reading>>,
    aggregates: RwLock<BTreeMap<(String, DateTime<Utc>), HourlyAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn upsert_readings(&self, readings: &[Reading]) -> Result<(), StoreError> {
        // ---
        let mut map = self.readings.write().unwrap_or_else(|e| e.into_inner());
        for r in readings {
            map.insert(r.dedup_key(), r.clone());
        }
        Ok(())
    }

    async fn upsert_aggregates(&self, aggregates: &[HourlyAggregate]) -> Result<(), StoreError> {
        // ---
        let mut map = self.aggregates.write().unwrap_or_else(|e| e.into_inner());
        for a in aggregates {
            map.insert((a.sensor_id.clone(), a.hour), a.clone());
        }
        Ok(())
    }

    async fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<Reading>, StoreError> {
        // ---
        let map = self.readings.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Reading> = map
            .values()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.timestamp, &a.sensor_id).cmp(&(b.timestamp, &b.sensor_id)));
        Ok(out)
    }

    async fn sensor_aggregates(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        // ---
        if from >= to {
            return Ok(Vec::new());
        }
        let map = self.aggregates.read().unwrap_or_else(|e| e.into_inner());
        let lo = (sensor_id.to_string(), from);
        let hi = (sensor_id.to_string(), to);
        Ok(map.range(lo..hi).map(|(_, a)| a.clone()).collect())
    }

    async fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let mut readings = self.readings.write().unwrap_or_else(|e| e.into_inner());
        let mut aggregates = self.aggregates.write().unwrap_or_else(|e| e.into_inner());
        let before = readings.len() + aggregates.len();
        readings.retain(|key, _| key.timestamp >= cutoff);
        aggregates.retain(|(_, hour), _| *hour >= cutoff);
        Ok((before - readings.len() - aggregates.len()) as u64)
    }
}
