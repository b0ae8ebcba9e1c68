//! Aggregation Engine: time-windowed single- and cross-station queries.
//!
//! A query range is cut into interval buckets starting at `range.start`;
//! the last bucket is truncated at `range.end`. Each bucket is served by the
//! Cache Coordinator and computed from one store scan per station on a miss.
//!
//! Cross-station values use a two-stage reduction: measurements are first
//! reduced within each station's bucket, then the per-station results are
//! reduced across stations (average of averages, min of mins, sum of sums).
//! `count` counts raw measurements, so its second stage is a sum. A station
//! without data in a bucket contributes nothing to that bucket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheCoordinator, CacheKey, CacheValue, WindowKey};
use crate::config::QueryConfig;
use crate::error::{CoreError, CoreResult};
use crate::ingest::StationRegistry;
use crate::models::{AggregateWindow, AggregationFn, Bucket, Measurement, TimeRange};
use crate::store::MeasurementStore;

mod cursor;

pub use cursor::Cursor;

// ---

/// Bucket ordering of a result page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "+time" | "time" => Ok(SortOrder::Asc),
            "desc" | "-time" => Ok(SortOrder::Desc),
            other => Err(CoreError::invalid_query(format!(
                "unsupported sort '{other}' (expected asc|desc)"
            ))),
        }
    }
}

/// Parsed, already-authenticated query parameters.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub stations: Vec<String>,
    pub fields: Vec<String>,
    pub range: TimeRange,
    pub interval: TimeDelta,
    pub aggregation: AggregationFn,
    /// Page size; the configured default applies when unset.
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub sort: SortOrder,
    /// Deadline; the configured default applies when unset.
    pub timeout: Option<Duration>,
}

/// One page of an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPage {
    pub window: AggregateWindow,
    /// Opaque cursor for the next page; absent on the last page.
    pub next_cursor: Option<String>,
    pub total_buckets: u64,
}

/// Answers aggregate and latest-reading queries. Cloning is cheap.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn MeasurementStore>,
    cache: CacheCoordinator,
    registry: Arc<StationRegistry>,
    config: QueryConfig,
}

/// Validated query shape shared by every bucket computation.
#[derive(Debug, Clone)]
struct Plan {
    stations: Vec<String>,
    fields: Vec<String>,
    range: TimeRange,
    interval: TimeDelta,
    aggregation: AggregationFn,
    total: u64,
}

impl Plan {
    /// Range of bucket `index`, clamped to the query range.
    fn bucket_range(&self, index: u64) -> TimeRange {
        // ---
        let start = from_nanos(nanos(self.interval) * i128::from(index))
            .and_then(|offset| self.range.start.checked_add_signed(offset))
            .map_or(self.range.end, |start| start.min(self.range.end));
        let end = start
            .checked_add_signed(self.interval)
            .map_or(self.range.end, |end| end.min(self.range.end));
        TimeRange::new(start, end)
    }
}

const NANOS_PER_SEC: i128 = 1_000_000_000;

fn nanos(d: TimeDelta) -> i128 {
    i128::from(d.num_seconds()) * NANOS_PER_SEC + i128::from(d.subsec_nanos())
}

fn from_nanos(n: i128) -> Option<TimeDelta> {
    let secs = i64::try_from(n.div_euclid(NANOS_PER_SEC)).ok()?;
    let sub = u32::try_from(n.rem_euclid(NANOS_PER_SEC)).ok()?;
    TimeDelta::new(secs, sub)
}

impl AggregationEngine {
    // ---
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        cache: CacheCoordinator,
        registry: Arc<StationRegistry>,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
        }
    }

    /// Run an aggregate query and return one page of buckets.
    #[instrument(
        skip(self, request),
        fields(
            stations = ?request.stations,
            fields = ?request.fields,
            aggregation = %request.aggregation
        )
    )]
    pub async fn query(&self, request: QueryRequest) -> CoreResult<QueryPage> {
        // ---
        let plan = self.plan(&request)?;
        let limit = self.page_size(request.limit)?;
        let fingerprint = Cursor::fingerprint(&plan.stations, &plan.fields, &request, plan.interval);

        let offset = match request.cursor.as_deref() {
            Some(raw) => Cursor::decode(raw, fingerprint)?.offset,
            None => 0,
        };

        let page_end = offset.saturating_add(limit as u64).min(plan.total);
        let indices: Vec<u64> = (offset..page_end.max(offset))
            .map(|i| match request.sort {
                SortOrder::Asc => i,
                SortOrder::Desc => plan.total - 1 - i,
            })
            .collect();

        let deadline = request.timeout.unwrap_or(self.config.default_timeout);
        let buckets = match tokio::time::timeout(deadline, self.compute_buckets(&plan, &indices)).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Query deadline exceeded");
                return Err(CoreError::QueryTimeout {
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
        };

        let next_cursor = (page_end < plan.total).then(|| {
            Cursor {
                offset: page_end,
                fingerprint,
            }
            .encode()
        });

        debug!(
            offset,
            returned = buckets.len(),
            total = plan.total,
            "Query page assembled"
        );

        Ok(QueryPage {
            window: AggregateWindow {
                stations: plan.stations,
                fields: plan.fields,
                start: plan.range.start,
                end: plan.range.end,
                interval: request.interval,
                aggregation: plan.aggregation,
                buckets,
            },
            next_cursor,
            total_buckets: plan.total,
        })
    }

    /// Newest measurement of a registered station.
    #[instrument(skip(self))]
    pub async fn latest(&self, station_id: &str) -> CoreResult<Option<Measurement>> {
        // ---
        if !self.registry.is_known(station_id) {
            return Err(CoreError::UnknownStation {
                station: station_id.to_string(),
            });
        }

        let store = self.store.clone();
        let station = station_id.to_string();
        let value = self
            .cache
            .get_or_compute(
                CacheKey::latest(station_id),
                move || async move {
                    let latest = store.latest(&station).await?;
                    Ok(CacheValue::Latest(latest.map(Arc::new)))
                },
                self.cache.default_ttl(),
            )
            .await?;

        match value {
            CacheValue::Latest(m) => Ok(m.map(|m| (*m).clone())),
            CacheValue::Window(_) => Err(CoreError::store("latest key holds a window value")),
        }
    }

    fn plan(&self, request: &QueryRequest) -> CoreResult<Plan> {
        // ---
        let stations = normalize_set(&request.stations);
        let fields = normalize_set(&request.fields);

        if stations.is_empty() {
            return Err(CoreError::invalid_query("station set must not be empty"));
        }
        if fields.is_empty() {
            return Err(CoreError::invalid_query("field set must not be empty"));
        }
        if request.range.start >= request.range.end {
            return Err(CoreError::invalid_query("time range start must be before end"));
        }

        let interval_ns = nanos(request.interval);
        if interval_ns <= 0 {
            return Err(CoreError::invalid_query("interval must be positive"));
        }

        // Ceiling division so the last bucket always ends at `range.end`;
        // an interval longer than the range yields one bucket.
        let span_ns = nanos(request.range.end - request.range.start);
        let total = (span_ns + interval_ns - 1) / interval_ns;
        let total = u64::try_from(total)
            .ok()
            .filter(|&n| n <= self.config.max_buckets)
            .ok_or_else(|| {
                CoreError::invalid_query(format!(
                    "query spans {total} buckets, more than the maximum of {}",
                    self.config.max_buckets
                ))
            })?;

        Ok(Plan {
            stations,
            fields,
            range: request.range,
            interval: request.interval,
            aggregation: request.aggregation,
            total,
        })
    }

    fn page_size(&self, limit: Option<usize>) -> CoreResult<usize> {
        match limit {
            None => Ok(self.config.default_page_size),
            Some(n) if n >= 1 && n <= self.config.max_page_size => Ok(n),
            Some(n) => Err(CoreError::invalid_query(format!(
                "limit {n} outside 1..={}",
                self.config.max_page_size
            ))),
        }
    }

    /// Compute the buckets at `indices`, at most `concurrency` at a time.
    /// Any failure fails the whole page.
    async fn compute_buckets(&self, plan: &Plan, indices: &[u64]) -> CoreResult<Vec<Bucket>> {
        // ---
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (slot, &index) in indices.iter().enumerate() {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CoreError::store("query concurrency limiter closed"))?;
            let engine = self.clone();
            let plan = plan.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (slot, engine.bucket(&plan, index).await)
            });
        }

        let mut out: Vec<Option<Bucket>> = vec![None; indices.len()];
        while let Some(joined) = tasks.join_next().await {
            let (slot, result) =
                joined.map_err(|e| CoreError::store(format!("bucket task failed: {e}")))?;
            out[slot] = Some(result?);
        }
        Ok(out.into_iter().flatten().collect())
    }

    async fn bucket(&self, plan: &Plan, index: u64) -> CoreResult<Bucket> {
        // ---
        let range = plan.bucket_range(index);
        let key = CacheKey::Window(WindowKey::new(
            &plan.stations,
            &plan.fields,
            range,
            plan.interval,
            plan.aggregation,
        ));

        let store = self.store.clone();
        let plan = plan.clone();
        let value = self
            .cache
            .get_or_compute(
                key,
                move || async move {
                    let window = compute_window(store.as_ref(), &plan, range).await?;
                    Ok(CacheValue::Window(Arc::new(window)))
                },
                self.cache.default_ttl(),
            )
            .await?;

        match value {
            CacheValue::Window(window) => window
                .buckets
                .first()
                .cloned()
                .ok_or_else(|| CoreError::store("cached window has no bucket")),
            CacheValue::Latest(_) => Err(CoreError::store("window key holds a latest value")),
        }
    }
}

fn normalize_set(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Scan every station over `range` and reduce into a single-bucket window.
async fn compute_window(
    store: &dyn MeasurementStore,
    plan: &Plan,
    range: TimeRange,
) -> CoreResult<AggregateWindow> {
    // ---
    let mut per_station: Vec<Vec<Measurement>> = Vec::with_capacity(plan.stations.len());
    for station in &plan.stations {
        per_station.push(store.scan(station, &plan.fields, range).await?);
    }

    let values = reduce_bucket(&plan.fields, plan.aggregation, &per_station);

    Ok(AggregateWindow {
        stations: plan.stations.clone(),
        fields: plan.fields.clone(),
        start: range.start,
        end: range.end,
        interval: plan.interval,
        aggregation: plan.aggregation,
        buckets: vec![Bucket {
            start: range.start,
            end: range.end,
            values,
        }],
    })
}

/// Two-stage reduction of one bucket: within each station, then across stations.
pub fn reduce_bucket(
    fields: &[String],
    aggregation: AggregationFn,
    per_station: &[Vec<Measurement>],
) -> BTreeMap<String, f64> {
    // ---
    let mut out = BTreeMap::new();

    for field in fields {
        let station_results: Vec<f64> = per_station
            .iter()
            .filter_map(|rows| {
                let values: Vec<f64> = rows.iter().filter_map(|m| m.value(field)).collect();
                reduce(aggregation, &values)
            })
            .collect();

        let combined = match aggregation {
            AggregationFn::Count => Some(station_results.iter().sum()),
            other => reduce(other, &station_results),
        };
        if let Some(v) = combined {
            out.insert(field.clone(), v);
        }
    }
    out
}

/// Single-stage reduction; `None` when there is nothing to reduce.
fn reduce(aggregation: AggregationFn, values: &[f64]) -> Option<f64> {
    // ---
    if values.is_empty() {
        return None;
    }
    let reduced = match aggregation {
        AggregationFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggregationFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationFn::Sum => values.iter().sum(),
        AggregationFn::Count => values.len() as f64,
    };
    Some(reduced)
}

#[cfg(test)]
mod tests;
