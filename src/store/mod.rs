//! Backing store seam.
//!
//! The engine treats the time-series store as a narrow key-value interface:
//! idempotent upserts keyed by `(station, timestamp)`, range scans restricted
//! to a station and field set, and a latest-reading lookup. Alert rule
//! definitions and registered stations live in a separate metadata store.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! local runs, and [`PgStore`] backed by PostgreSQL.

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::models::{AlertRuleDefinition, Measurement, TimeRange};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Time-series storage for normalized measurements.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    // ---
    /// Insert or merge a measurement; returns the stored (merged) value.
    async fn upsert(&self, measurement: &Measurement) -> CoreResult<Measurement>;

    /// Measurements of one station inside `range`, restricted to `fields`,
    /// ordered by timestamp. Measurements carrying none of the fields are
    /// omitted.
    async fn scan(
        &self,
        station_id: &str,
        fields: &[String],
        range: TimeRange,
    ) -> CoreResult<Vec<Measurement>>;

    /// Newest measurement of a station, if any.
    async fn latest(&self, station_id: &str) -> CoreResult<Option<Measurement>>;

    /// Cheap reachability check used by the health endpoint.
    async fn ping(&self) -> CoreResult<()>;
}

/// Persistence for alert rules and the station registry.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn save_rule(&self, rule: &AlertRuleDefinition) -> CoreResult<()>;

    /// Returns whether a rule was deleted.
    async fn delete_rule(&self, rule_id: &str) -> CoreResult<bool>;

    async fn load_rules(&self) -> CoreResult<Vec<AlertRuleDefinition>>;

    async fn save_station(&self, station_id: &str) -> CoreResult<()>;

    async fn load_stations(&self) -> CoreResult<Vec<String>>;
}
