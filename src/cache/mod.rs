//! Cache Coordinator: hot-path cache of latest readings and aggregate buckets.
//!
//! Every cache mutation goes through this module. Lookups that miss are
//! computed at most once per key at a time: the first caller registers an
//! in-flight computation, later callers for the same key attach to it and
//! receive the same value or the same error.
//!
//! Invalidation is eager for "latest" keys and lazy for window keys: a
//! window touched by a new measurement is only marked stale and gets
//! recomputed on its next read. TTL expiry bounds staleness even if an
//! invalidation is missed.
//!
//! Entries are spread over independently locked shards and no lock is held
//! across an `.await`.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::future::Future;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{AggregateWindow, AggregationFn, Measurement, TimeRange};

// ---

/// Identity of a cached computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Newest measurement of one station.
    Latest { station_id: String },
    /// Reduced values of one window (a query bucket).
    Window(WindowKey),
}

/// Key of an aggregate window. Station and field sets are kept sorted and
/// deduplicated so equal sets hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub stations: Vec<String>,
    pub fields: Vec<String>,
    pub range: TimeRange,
    pub interval: TimeDelta,
    pub aggregation: AggregationFn,
}

impl WindowKey {
    pub fn new(
        stations: &[String],
        fields: &[String],
        range: TimeRange,
        interval: TimeDelta,
        aggregation: AggregationFn,
    ) -> Self {
        Self {
            stations: sorted_set(stations),
            fields: sorted_set(fields),
            range,
            interval,
            aggregation,
        }
    }

    fn covers(&self, station_id: &str, ts: DateTime<Utc>) -> bool {
        self.range.contains(ts) && self.stations.iter().any(|s| s == station_id)
    }
}

fn sorted_set(items: &[String]) -> Vec<String> {
    let mut out = items.to_vec();
    out.sort();
    out.dedup();
    out
}

impl CacheKey {
    pub fn latest(station_id: impl Into<String>) -> Self {
        Self::Latest {
            station_id: station_id.into(),
        }
    }
}

/// Cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// `None` records that the station has no data yet.
    Latest(Option<Arc<Measurement>>),
    Window(Arc<AggregateWindow>),
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that attached to an in-flight computation.
    pub coalesced: u64,
    pub computations: u64,
    pub failures: u64,
    pub invalidations: u64,
    pub entries: u64,
}

struct Entry {
    value: CacheValue,
    /// When the value was computed or written through.
    fresh_at: Instant,
    expires_at: Instant,
    stale: bool,
}

impl Entry {
    fn new(value: CacheValue, ttl: Duration, stale: bool) -> Self {
        let now = Instant::now();
        Self {
            value,
            fresh_at: now,
            expires_at: now + ttl,
            stale,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        !self.stale && now < self.expires_at
    }
}

type FlightResult = Option<CoreResult<CacheValue>>;

struct Flight {
    id: u64,
    rx: watch::Receiver<FlightResult>,
    /// An invalidation hit this key while the computation was running.
    invalidated: bool,
}

enum Slot {
    Ready(Entry),
    InFlight(Flight),
}

enum Lookup {
    Hit(CacheValue),
    Join(watch::Receiver<FlightResult>),
    Miss,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
}

struct Inner {
    shards: Vec<Mutex<HashMap<CacheKey, Slot>>>,
    hasher: RandomState,
    next_flight: AtomicU64,
    default_ttl: Duration,
    counters: Counters,
}

impl Inner {
    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        let idx = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        lock(&self.shards[idx])
    }

    /// Store the outcome of flight `id` unless the slot moved on meanwhile.
    fn complete(&self, key: &CacheKey, id: u64, result: &CoreResult<CacheValue>, ttl: Duration) {
        // ---
        let mut shard = self.shard(key);
        let invalidated = match shard.get(key) {
            Some(Slot::InFlight(flight)) if flight.id == id => flight.invalidated,
            _ => return,
        };

        match result {
            Ok(value) => {
                shard.insert(key.clone(), Slot::Ready(Entry::new(value.clone(), ttl, invalidated)));
            }
            Err(_) => {
                // Failures are never cached; the next caller retries.
                shard.remove(key);
            }
        }
    }

    fn abandon(&self, key: &CacheKey, id: u64) {
        let mut shard = self.shard(key);
        if matches!(shard.get(key), Some(Slot::InFlight(f)) if f.id == id) {
            shard.remove(key);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the in-flight marker if the computation task dies before completing.
struct FlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
    armed: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = ?self.key, "Cache computation ended without a result");
            self.inner.abandon(&self.key, self.id);
        }
    }
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<Inner>,
}

impl CacheCoordinator {
    // ---
    pub fn new(config: &CacheConfig) -> Self {
        let shards = config.shards.max(1);
        Self {
            inner: Arc::new(Inner {
                shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
                hasher: RandomState::new(),
                next_flight: AtomicU64::new(1),
                default_ttl: config.ttl,
                counters: Counters::default(),
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        // ---
        let shard = self.inner.shard(key);
        let value = match shard.get(key) {
            Some(Slot::Ready(entry)) if entry.is_fresh(Instant::now()) => Some(entry.value.clone()),
            _ => None,
        };
        drop(shard);

        let counter = if value.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Age of the cached value for `key`, if one is present (fresh or not).
    pub fn freshness(&self, key: &CacheKey) -> Option<Duration> {
        match self.inner.shard(key).get(key) {
            Some(Slot::Ready(entry)) => Some(entry.fresh_at.elapsed()),
            _ => None,
        }
    }

    /// Return the fresh value for `key`, computing it at most once across
    /// concurrent callers.
    ///
    /// `compute` runs on its own task: a caller that gives up (deadline,
    /// cancellation) does not abort the computation for the other waiters.
    /// Errors reach every waiter and are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
        ttl: Duration,
    ) -> CoreResult<CacheValue>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<CacheValue>> + Send + 'static,
    {
        // ---
        let counters = &self.inner.counters;
        let (mut rx, leader) = {
            let mut shard = self.inner.shard(&key);
            let found = match shard.get(&key) {
                Some(Slot::Ready(entry)) if entry.is_fresh(Instant::now()) => {
                    Lookup::Hit(entry.value.clone())
                }
                Some(Slot::InFlight(flight)) => Lookup::Join(flight.rx.clone()),
                _ => Lookup::Miss,
            };

            match found {
                Lookup::Hit(value) => {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Lookup::Join(rx) => {
                    counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    (rx, None)
                }
                Lookup::Miss => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                    counters.computations.fetch_add(1, Ordering::Relaxed);

                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    shard.insert(
                        key.clone(),
                        Slot::InFlight(Flight {
                            id,
                            rx: rx.clone(),
                            invalidated: false,
                        }),
                    );
                    (rx, Some((id, tx)))
                }
            }
        };

        if let Some((id, tx)) = leader {
            self.spawn_flight(key, id, tx, compute, ttl);
        }

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(CoreError::store(
                "cache computation ended without producing a result",
            ))
        })
    }

    fn spawn_flight<F, Fut>(
        &self,
        key: CacheKey,
        id: u64,
        tx: watch::Sender<FlightResult>,
        compute: F,
        ttl: Duration,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<CacheValue>> + Send + 'static,
    {
        // ---
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut guard = FlightGuard {
                inner: inner.clone(),
                key: key.clone(),
                id,
                armed: true,
            };

            trace!(?key, flight = id, "Computing cache entry");
            let result = compute().await;
            if let Err(e) = &result {
                inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                debug!(?key, error = %e, "Cache computation failed");
            }

            // Publish to the map first so callers arriving after the
            // waiters wake up find the entry.
            inner.complete(&key, id, &result, ttl);
            guard.armed = false;
            let _ = tx.send(Some(result));
        });
    }

    /// Write-through of a station's newest measurement.
    ///
    /// Only replaces the cached latest reading if `measurement` is at least
    /// as new.
    pub fn put_latest(&self, measurement: &Measurement) {
        // ---
        let key = CacheKey::latest(measurement.station_id.clone());
        let mut shard = self.inner.shard(&key);

        if let Some(Slot::Ready(entry)) = shard.get(&key) {
            if let CacheValue::Latest(Some(current)) = &entry.value {
                if !entry.stale && current.timestamp > measurement.timestamp {
                    return;
                }
            }
        }

        let value = CacheValue::Latest(Some(Arc::new(measurement.clone())));
        shard.insert(key, Slot::Ready(Entry::new(value, self.inner.default_ttl, false)));
    }

    /// React to an accepted measurement of `station_id` at `ts`.
    ///
    /// Evicts the station's latest entry and marks every window entry whose
    /// range contains `ts` and whose station set includes the station as
    /// stale. In-flight computations for affected keys still answer their
    /// waiters, but their result is stored stale. Returns the number of
    /// entries affected.
    pub fn invalidate(&self, station_id: &str, ts: DateTime<Utc>) -> usize {
        // ---
        let mut affected = 0;

        for shard in &self.inner.shards {
            let mut map = lock(shard);
            let mut evict = Vec::new();

            for (key, slot) in map.iter_mut() {
                let hit = match key {
                    CacheKey::Latest { station_id: s } => s == station_id,
                    CacheKey::Window(w) => w.covers(station_id, ts),
                };
                if !hit {
                    continue;
                }
                affected += 1;

                match (key, slot) {
                    (_, Slot::InFlight(flight)) => flight.invalidated = true,
                    (CacheKey::Latest { .. }, Slot::Ready(_)) => evict.push(key.clone()),
                    (CacheKey::Window(_), Slot::Ready(entry)) => entry.stale = true,
                }
            }

            for key in evict {
                map.remove(&key);
            }
        }

        if affected > 0 {
            self.inner
                .counters
                .invalidations
                .fetch_add(affected as u64, Ordering::Relaxed);
            trace!(station = %station_id, %ts, affected, "Invalidated cache entries");
        }
        affected
    }

    /// Drop expired and stale entries. In-flight computations are kept.
    pub fn purge_expired(&self) -> usize {
        // ---
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.inner.shards {
            let mut map = lock(shard);
            let before = map.len();
            map.retain(|_, slot| match slot {
                Slot::Ready(entry) => entry.is_fresh(now),
                Slot::InFlight(_) => true,
            });
            purged += before - map.len();
        }
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
        purged
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        // ---
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.purge_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        // ---
        let c = &self.inner.counters;
        let entries = self
            .inner
            .shards
            .iter()
            .map(|s| lock(s).len() as u64)
            .sum();
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            entries,
        }
    }
}
