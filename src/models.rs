//! Canonical data models shared by every component of the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

// ---

/// Wildcard station selector for alert rules.
pub const ANY_STATION: &str = "*";

/// One normalized sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    // ---
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
    /// Station software that produced the report.
    pub provenance: String,
}

impl Measurement {
    // ---
    pub fn value(&self, field: &str) -> Option<f64> {
        self.fields.get(field).copied()
    }

    /// Merge a later report for the same station and timestamp.
    ///
    /// Fields present in `other` overwrite ours, absent ones are kept.
    pub fn merge(&mut self, other: &Measurement) {
        // ---
        debug_assert_eq!(self.station_id, other.station_id);
        debug_assert_eq!(self.timestamp, other.timestamp);

        for (field, value) in &other.fields {
            self.fields.insert(field.clone(), *value);
        }
        self.provenance = other.provenance.clone();
    }
}

/// Raw station report as received from a protocol adapter.
///
/// The `format` tag names the station software dialect.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum RawReport {
    /// Canonical JSON shape used by our own station firmware.
    Generic(GenericReport),
    /// Weather Underground / Ecowitt upload parameters.
    Wunderground(WundergroundReport),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenericReport {
    pub station_id: Option<String>,
    /// RFC 3339 string or UNIX epoch seconds.
    pub timestamp: Option<Value>,
    pub fields: Option<BTreeMap<String, Value>>,
    pub software: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WundergroundReport {
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl RawReport {
    // ---
    /// Decode a report from an untyped JSON document.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::malformed(e.to_string()))
    }

    /// Station id named by the payload, if any.
    pub fn station_hint(&self) -> Option<&str> {
        // ---
        let id = match self {
            RawReport::Generic(r) => r.station_id.as_deref(),
            RawReport::Wunderground(r) => r.params.get("ID").and_then(Value::as_str),
        };
        id.map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Reduction applied within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFn {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregationFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationFn::Avg => "avg",
            AggregationFn::Min => "min",
            AggregationFn::Max => "max",
            AggregationFn::Sum => "sum",
            AggregationFn::Count => "count",
        }
    }
}

impl FromStr for AggregationFn {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(AggregationFn::Avg),
            "min" => Ok(AggregationFn::Min),
            "max" => Ok(AggregationFn::Max),
            "sum" => Ok(AggregationFn::Sum),
            "count" => Ok(AggregationFn::Count),
            other => Err(CoreError::invalid_query(format!(
                "unsupported aggregation '{other}' (expected avg|min|max|sum|count)"
            ))),
        }
    }
}

impl fmt::Display for AggregationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// One interval-sized slice of an aggregate window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Reduced value per field; fields without data are absent.
    pub values: BTreeMap<String, f64>,
}

/// Result of reducing measurements over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateWindow {
    pub stations: Vec<String>,
    pub fields: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(serialize_with = "serialize_interval")]
    pub interval: TimeDelta,
    pub aggregation: AggregationFn,
    pub buckets: Vec<Bucket>,
}

fn serialize_interval<S: Serializer>(interval: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_iso_duration(*interval))
}

/// Alert rule evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Normal,
    Triggered,
    Suppressed,
}

/// Kind of state transition carried by an [`AlertEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Triggered,
    Cleared,
}

/// Immutable record of an alert rule transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub event_id: Uuid,
    pub rule_id: String,
    pub station_id: String,
    pub field: String,
    pub value: f64,
    pub threshold: f64,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
}

/// Alert rule as submitted by the admin API and persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleDefinition {
    pub id: String,
    /// Station id, or `*` for any station.
    #[serde(default = "any_station")]
    pub station: String,
    /// Condition expression, e.g. `temperature < 0`.
    pub condition: String,
    /// Topic override; defaults to `weather/alerts/<id>`.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub hysteresis: Option<f64>,
    /// Number of triggers within the cooldown window before suppression.
    #[serde(default)]
    pub suppress_after: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

fn any_station() -> String {
    ANY_STATION.to_string()
}

// ---

/// Parse the ISO 8601 duration subset used by the REST conventions.
///
/// Accepts `PnW`, `PnD`, `PTnHnMnS` and combinations of days with a time
/// part. Seconds may carry a fraction (`PT0.5S`). Years and months are
/// rejected since they have no fixed length.
pub fn parse_iso_duration(input: &str) -> CoreResult<TimeDelta> {
    // ---
    let bad = || CoreError::invalid_query(format!("invalid ISO 8601 duration '{input}'"));

    let rest = input.trim().strip_prefix(['P', 'p']).ok_or_else(bad)?;
    if rest.is_empty() {
        return Err(bad());
    }

    let mut total_ms: f64 = 0.0;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for ch in rest.chars() {
        match ch {
            'T' | 't' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' | ',' => number.push(if ch == ',' { '.' } else { ch }),
            unit => {
                let n: f64 = number.parse().map_err(|_| bad())?;
                number.clear();
                let unit_ms = match (in_time, unit.to_ascii_uppercase()) {
                    (false, 'W') => 7.0 * 86_400_000.0,
                    (false, 'D') => 86_400_000.0,
                    (true, 'H') => 3_600_000.0,
                    (true, 'M') => 60_000.0,
                    (true, 'S') => 1_000.0,
                    _ => return Err(bad()),
                };
                total_ms += n * unit_ms;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component || !total_ms.is_finite() {
        return Err(bad());
    }
    // `as` saturates; anything at or past the i64 edge is out of range
    let total_ms = total_ms.round();
    if total_ms >= i64::MAX as f64 {
        return Err(bad());
    }

    TimeDelta::try_milliseconds(total_ms as i64).ok_or_else(bad)
}

/// Render a duration as an ISO 8601 string (`PT1H`, `P1DT30M`, `PT0.25S`).
pub fn format_iso_duration(d: TimeDelta) -> String {
    // ---
    let mut ms = d.num_milliseconds();
    if ms == 0 {
        return "PT0S".to_string();
    }
    let sign = if ms < 0 { "-" } else { "" };
    ms = ms.abs();

    let days = ms / 86_400_000;
    ms %= 86_400_000;
    let hours = ms / 3_600_000;
    ms %= 3_600_000;
    let minutes = ms / 60_000;
    ms %= 60_000;

    let mut out = format!("{sign}P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || ms > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if ms > 0 {
            if ms % 1000 == 0 {
                out.push_str(&format!("{}S", ms / 1000));
            } else {
                out.push_str(&format!("{}S", ms as f64 / 1000.0));
            }
        }
    }
    out
}
