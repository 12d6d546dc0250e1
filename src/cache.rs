//! Result cache with TTL freshness, single-flight recomputation and
//! stale-on-error fallback.
//!
//! ## Lifecycle of a key
//!
//! `Empty -> Pending -> Fresh -> Stale -> (evicted)`
//!
//! - A `Fresh` entry (now < expires_at) is returned without locking anything
//!   beyond a short read of the slot.
//! - An `Empty` or `Stale` entry triggers a recompute. The recompute runs
//!   under a per-key async mutex, so concurrent readers of the same key wait
//!   for the one in-flight computation and then read its result.
//! - When a recompute fails and a previous value exists, that value is
//!   served with `stale = true`. Without a previous value the error surfaces.
//! - [`CacheManager::sweep`] evicts entries that have been stale for longer
//!   than [`TtlPolicy::max_stale`].
//!
//! Time comes from an injected [`Clock`], so freshness is testable without
//! sleeping.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;

use crate::error::CoreResult;

// ---

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Logical query a cached value answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Current(Option<String>),
    Summary,
    Rankings,
    Prediction { sensor_id: String, hours_ahead: u32 },
    Historical { sensor_id: String, days: u32 },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            CacheKey::Current(Some(city)) => write!(f, "current:{}", city.to_lowercase()),
            CacheKey::Current(None) => write!(f, "current:*"),
            CacheKey::Summary => write!(f, "summary"),
            CacheKey::Rankings => write!(f, "rankings"),
            CacheKey::Prediction {
                sensor_id,
                hours_ahead,
            } => write!(f, "prediction:{}:{}", sensor_id, hours_ahead),
            CacheKey::Historical { sensor_id, days } => {
                write!(f, "historical:{}:{}", sensor_id, days)
            }
        }
    }
}

/// How long each kind of key stays fresh.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    /// Current readings, summary and rankings.
    pub current: ChronoDuration,
    /// Historical data stays fresh for this long per requested day.
    pub historical_per_day: ChronoDuration,
    /// Predictions are fresh until the next multiple of this period.
    pub prediction_refresh: ChronoDuration,
    /// Stale entries older than this are evicted by `sweep`.
    pub max_stale: ChronoDuration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            current: ChronoDuration::seconds(30),
            historical_per_day: ChronoDuration::seconds(60),
            prediction_refresh: ChronoDuration::minutes(30),
            max_stale: ChronoDuration::hours(24),
        }
    }
}

impl TtlPolicy {
    pub fn expires_at(&self, key: &CacheKey, now: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        match key {
            CacheKey::Current(_) | CacheKey::Summary | CacheKey::Rankings => now + self.current,
            CacheKey::Historical { days, .. } => {
                now + self.historical_per_day * i32::try_from(*days).unwrap_or(i32::MAX)
            }
            CacheKey::Prediction { .. } => next_boundary(now, self.prediction_refresh),
        }
    }
}

/// Next multiple of `period` (since the epoch) strictly after `now`.
fn next_boundary(now: DateTime<Utc>, period: ChronoDuration) -> DateTime<Utc> {
    // ---
    let period_ms = period.num_milliseconds().max(1);
    let now_ms = now.timestamp_millis();
    let next_ms = (now_ms.div_euclid(period_ms) + 1) * period_ms;
    Utc.timestamp_millis_opt(next_ms).single().unwrap_or(now + period)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    Empty,
    Pending,
    Fresh,
    Stale,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

struct Slot<V> {
    entry: RwLock<Option<Arc<CacheEntry<V>>>>,
    flight: tokio::sync::Mutex<()>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            entry: RwLock::new(None),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<CacheEntry<V>>> {
        self.entry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store(&self, entry: CacheEntry<V>) {
        *self.entry.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(entry));
    }
}

/// A value served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

/// Lock-free counters, shared by every cache of a service.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub recomputes: AtomicU64,
    pub failures: AtomicU64,
    pub stale_served: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub recomputes: u64,
    pub failures: u64,
    pub stale_served: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        // ---
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recomputes: self.recomputes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
        }
    }
}

pub struct CacheManager<V> {
    slots: RwLock<HashMap<String, Arc<Slot<V>>>>,
    clock: Arc<dyn Clock>,
    policy: TtlPolicy,
    stats: Arc<CacheStats>,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync,
{
    pub fn new(clock: Arc<dyn Clock>, policy: TtlPolicy, stats: Arc<CacheStats>) -> Self {
        // ---
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
            policy,
            stats,
        }
    }

    fn slot(&self, name: &str) -> Arc<Slot<V>> {
        // ---
        {
            let map = self.slots.read().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = map.get(name) {
                return slot.clone();
            }
        }
        let mut map = self.slots.write().unwrap_or_else(|e| e.into_inner());
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<Slot<V>>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn fresh(&self, entry: &CacheEntry<V>) -> Option<Cached<V>> {
        (self.clock.now() < entry.expires_at).then(|| Cached {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            stale: false,
        })
    }

    /// Return the cached value for `key`, recomputing it with `compute` when
    /// it is missing or expired. At most one `compute` runs per key at a time.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> CoreResult<Cached<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<V>>,
    {
        // ---
        let name = key.to_string();
        let slot = self.slot(&name);

        if let Some(hit) = slot.current().and_then(|e| self.fresh(&e)) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let _flight = slot.flight.lock().await;

        // Another caller may have refreshed the entry while we waited.
        let previous = slot.current();
        if let Some(hit) = previous.as_ref().and_then(|e| self.fresh(e)) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.stats.recomputes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %name, "recomputing cache entry");

        match compute().await {
            Ok(value) => {
                let now = self.clock.now();
                let entry = CacheEntry {
                    value: value.clone(),
                    fetched_at: now,
                    expires_at: self.policy.expires_at(key, now),
                };
                slot.store(entry);
                Ok(Cached {
                    value,
                    fetched_at: now,
                    stale: false,
                })
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                match previous {
                    Some(prev) => {
                        self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            key = %name,
                            error = %err,
                            fetched_at = %prev.fetched_at,
                            "recompute failed, serving stale value"
                        );
                        Ok(Cached {
                            value: prev.value.clone(),
                            fetched_at: prev.fetched_at,
                            stale: true,
                        })
                    }
                    None => {
                        tracing::warn!(
                            key = %name,
                            error = %err,
                            "recompute failed with no prior value"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    /// Store a value computed elsewhere, e.g. by the scheduled refresh.
    pub async fn put(&self, key: &CacheKey, value: V) {
        // ---
        let name = key.to_string();
        let slot = self.slot(&name);
        let _flight = slot.flight.lock().await;
        let now = self.clock.now();
        slot.store(CacheEntry {
            value,
            fetched_at: now,
            expires_at: self.policy.expires_at(key, now),
        });
    }

    pub fn state(&self, key: &CacheKey) -> CacheState {
        // ---
        let Some(slot) = self.existing_slot(&key.to_string()) else {
            return CacheState::Empty;
        };
        if slot.flight.try_lock().is_err() {
            return CacheState::Pending;
        }
        match slot.current() {
            None => CacheState::Empty,
            Some(entry) if self.clock.now() < entry.expires_at => CacheState::Fresh,
            Some(_) => CacheState::Stale,
        }
    }

    /// Mark every entry stale. Values stay available as fallback.
    pub fn expire_all(&self) {
        // ---
        let now = self.clock.now();
        let slots: Vec<Arc<Slot<V>>> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for slot in slots {
            let mut guard = slot.entry.write().unwrap_or_else(|e| e.into_inner());
            let expired = guard
                .as_ref()
                .filter(|entry| entry.expires_at > now)
                .map(|entry| CacheEntry {
                    value: entry.value.clone(),
                    fetched_at: entry.fetched_at,
                    expires_at: now,
                });
            if let Some(entry) = expired {
                *guard = Some(Arc::new(entry));
            }
        }
    }

    /// Evict entries stale for longer than the policy allows. Pending keys
    /// are left alone.
    pub fn sweep(&self) -> usize {
        // ---
        let cutoff = self.clock.now() - self.policy.max_stale;
        let mut map = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, slot| {
            if slot.flight.try_lock().is_err() {
                return true;
            }
            match slot.current() {
                Some(entry) => entry.expires_at >= cutoff,
                None => false,
            }
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
