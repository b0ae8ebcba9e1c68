//! Converts station-software payloads into canonical [`Measurement`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::models::{GenericReport, Measurement, RawReport, WundergroundReport};

// ---

/// Sentinel Weather Underground clients send for a missing sensor.
const WU_MISSING: f64 = -9999.0;

/// Registered stations and the newest timestamp accepted from each.
#[derive(Debug, Default)]
pub struct StationRegistry {
    stations: RwLock<HashMap<String, Option<DateTime<Utc>>>>,
}

impl StationRegistry {
    // ---
    pub fn new<I, S>(stations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::default();
        for id in stations {
            registry.register(id);
        }
        registry
    }

    /// Register a station; returns `false` if it was already known.
    pub fn register(&self, station_id: impl Into<String>) -> bool {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        let id = station_id.into();
        if stations.contains_key(&id) {
            return false;
        }
        stations.insert(id, None);
        true
    }

    pub fn is_known(&self, station_id: &str) -> bool {
        self.stations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(station_id)
    }

    pub fn last_accepted(&self, station_id: &str) -> Option<DateTime<Utc>> {
        self.stations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(station_id)
            .copied()
            .flatten()
    }

    /// Advance the station's high-water mark; older timestamps leave it unchanged.
    pub fn record_accepted(&self, station_id: &str, ts: DateTime<Utc>) {
        let mut stations = self.stations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = stations.get_mut(station_id) {
            if last.map_or(true, |prev| ts > prev) {
                *last = Some(ts);
            }
        }
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .stations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Validates raw reports and produces canonical measurements.
///
/// Pure apart from reading the registry: it never writes to the cache or
/// the store.
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<StationRegistry>,
    skew: TimeDelta,
}

impl Normalizer {
    // ---
    pub fn new(registry: Arc<StationRegistry>, skew: std::time::Duration) -> Self {
        let skew = TimeDelta::from_std(skew).unwrap_or_else(|_| TimeDelta::days(36_500));
        Self { registry, skew }
    }

    pub fn registry(&self) -> &Arc<StationRegistry> {
        &self.registry
    }

    pub fn normalize(&self, raw: &RawReport) -> CoreResult<Measurement> {
        self.normalize_at(raw, Utc::now())
    }

    /// Normalize against an explicit wall-clock `now`.
    pub fn normalize_at(&self, raw: &RawReport, now: DateTime<Utc>) -> CoreResult<Measurement> {
        // ---
        let station_id = raw
            .station_hint()
            .ok_or_else(|| CoreError::malformed("missing station id"))?
            .to_string();

        if !self.registry.is_known(&station_id) {
            return Err(CoreError::UnknownStation {
                station: station_id,
            });
        }

        let (timestamp, fields, provenance) = match raw {
            RawReport::Generic(report) => parse_generic(report)?,
            RawReport::Wunderground(report) => parse_wunderground(report, now)?,
        };

        if fields.is_empty() {
            return Err(CoreError::malformed("report carries no numeric fields"));
        }

        // Stored timestamps keep microsecond precision.
        let timestamp = timestamp.trunc_subsecs(6);
        self.check_skew(&station_id, timestamp, now)?;

        debug!(
            station = %station_id,
            %timestamp,
            fields = fields.len(),
            "Normalized report"
        );

        Ok(Measurement {
            station_id,
            timestamp,
            fields,
            provenance,
        })
    }

    fn check_skew(
        &self,
        station_id: &str,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        // ---
        if let Some(limit) = now.checked_add_signed(self.skew) {
            if ts > limit {
                return Err(CoreError::malformed(format!(
                    "timestamp {ts} is ahead of the clock by more than the skew tolerance"
                )));
            }
        }
        if let Some(last) = self.registry.last_accepted(station_id) {
            if let Some(floor) = last.checked_sub_signed(self.skew) {
                if ts < floor {
                    return Err(CoreError::malformed(format!(
                        "timestamp {ts} is older than last accepted {last} minus the skew tolerance"
                    )));
                }
            }
        }
        Ok(())
    }
}

type Parsed = (DateTime<Utc>, BTreeMap<String, f64>, String);

fn parse_generic(report: &GenericReport) -> CoreResult<Parsed> {
    // ---
    let timestamp = match &report.timestamp {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CoreError::malformed(format!("unparseable timestamp '{s}': {e}")))?,
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(epoch_seconds)
            .ok_or_else(|| CoreError::malformed(format!("invalid epoch timestamp {n}")))?,
        Some(other) => {
            return Err(CoreError::malformed(format!(
                "timestamp must be a string or number, got {other}"
            )))
        }
        None => return Err(CoreError::malformed("missing timestamp")),
    };

    let raw_fields = report
        .fields
        .as_ref()
        .ok_or_else(|| CoreError::malformed("missing fields"))?;

    let mut fields = BTreeMap::new();
    for (name, value) in raw_fields {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::malformed("empty field name"));
        }
        if let Some(v) = numeric(value) {
            if !v.is_finite() {
                return Err(CoreError::malformed(format!("field '{name}' is not finite")));
            }
            fields.insert(name.to_string(), v);
        }
    }

    let provenance = report
        .software
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "generic".to_string());

    Ok((timestamp, fields, provenance))
}

/// Unit conversion applied to an upload parameter.
#[derive(Debug, Clone, Copy)]
enum Unit {
    Same,
    Fahrenheit,
    InchesOfMercury,
    MilesPerHour,
    Inches,
}

impl Unit {
    fn to_metric(self, v: f64) -> f64 {
        match self {
            Unit::Same => v,
            Unit::Fahrenheit => (v - 32.0) * 5.0 / 9.0,
            Unit::InchesOfMercury => v * 33.863_886_666_7,
            Unit::MilesPerHour => v * 1.609_344,
            Unit::Inches => v * 25.4,
        }
    }
}

/// Canonical field name and unit for each upload parameter.
fn wunderground_field(param: &str) -> Option<(&'static str, Unit)> {
    // ---
    let mapped = match param {
        "tempf" => ("temperature", Unit::Fahrenheit),
        "dewptf" => ("dew_point", Unit::Fahrenheit),
        "humidity" => ("humidity", Unit::Same),
        "baromin" => ("pressure", Unit::InchesOfMercury),
        "windspeedmph" => ("wind_speed", Unit::MilesPerHour),
        "windgustmph" => ("wind_gust", Unit::MilesPerHour),
        "winddir" => ("wind_direction", Unit::Same),
        "rainin" => ("rain", Unit::Inches),
        "dailyrainin" => ("daily_rain", Unit::Inches),
        "solarradiation" => ("solar_radiation", Unit::Same),
        "UV" => ("uv_index", Unit::Same),
        _ => return None,
    };
    Some(mapped)
}

fn parse_wunderground(report: &WundergroundReport, now: DateTime<Utc>) -> CoreResult<Parsed> {
    // ---
    let raw_date = report
        .params
        .get("dateutc")
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| CoreError::malformed("missing dateutc"))?;

    let timestamp = if raw_date.eq_ignore_ascii_case("now") {
        now
    } else {
        let cleaned = raw_date.replace('+', " ");
        NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc())
            .map_err(|e| CoreError::malformed(format!("unparseable dateutc '{raw_date}': {e}")))?
    };

    let mut fields = BTreeMap::new();
    for (param, value) in &report.params {
        let Some((name, unit)) = wunderground_field(param) else {
            continue;
        };
        let Some(v) = numeric(value) else {
            continue;
        };
        if v == WU_MISSING {
            continue;
        }
        if !v.is_finite() {
            return Err(CoreError::malformed(format!("parameter '{param}' is not finite")));
        }
        fields.insert(name.to_string(), unit.to_metric(v));
    }

    let provenance = report
        .params
        .get("softwaretype")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("wunderground")
        .to_string();

    Ok((timestamp, fields, provenance))
}

/// Numeric value of a JSON scalar; numeric strings are accepted.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    // ---
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}
