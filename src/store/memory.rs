use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{MeasurementStore, MetadataStore};
use crate::error::{CoreError, CoreResult};
use crate::models::{AlertRuleDefinition, Measurement, TimeRange};

// ---

/// In-memory implementation of both store traits.
///
/// Besides local runs it doubles as a test fixture: it counts scans, can
/// simulate an unreachable store and can delay scans to exercise deadlines.
#[derive(Default)]
pub struct MemoryStore {
    measurements: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, Measurement>>>,
    rules: RwLock<BTreeMap<String, AlertRuleDefinition>>,
    stations: RwLock<BTreeSet<String>>,
    unavailable: AtomicBool,
    scan_delay_ms: AtomicU64,
    scans: AtomicU64,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every scan by `delay`.
    pub fn set_scan_delay(&self, delay: Duration) {
        self.scan_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of range scans served so far.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of measurements stored for a station.
    pub async fn len(&self, station_id: &str) -> usize {
        self.measurements
            .read()
            .await
            .get(station_id)
            .map_or(0, BTreeMap::len)
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::store("memory store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn upsert(&self, measurement: &Measurement) -> CoreResult<Measurement> {
        // ---
        self.check_available()?;

        let mut all = self.measurements.write().await;
        let series = all.entry(measurement.station_id.clone()).or_default();
        let stored = series
            .entry(measurement.timestamp)
            .and_modify(|existing| existing.merge(measurement))
            .or_insert_with(|| measurement.clone());
        Ok(stored.clone())
    }

    async fn scan(
        &self,
        station_id: &str,
        fields: &[String],
        range: TimeRange,
    ) -> CoreResult<Vec<Measurement>> {
        // ---
        let delay = self.scan_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        self.scans.fetch_add(1, Ordering::SeqCst);

        if range.start >= range.end {
            return Ok(Vec::new());
        }

        let all = self.measurements.read().await;
        let Some(series) = all.get(station_id) else {
            return Ok(Vec::new());
        };

        let rows = series
            .range(range.start..range.end)
            .filter_map(|(_, m)| {
                let picked: BTreeMap<String, f64> = m
                    .fields
                    .iter()
                    .filter(|(name, _)| fields.contains(name))
                    .map(|(name, value)| (name.clone(), *value))
                    .collect();
                (!picked.is_empty()).then(|| Measurement {
                    fields: picked,
                    ..m.clone()
                })
            })
            .collect();
        Ok(rows)
    }

    async fn latest(&self, station_id: &str) -> CoreResult<Option<Measurement>> {
        // ---
        self.check_available()?;
        let all = self.measurements.read().await;
        Ok(all
            .get(station_id)
            .and_then(|series| series.values().next_back().cloned()))
    }

    async fn ping(&self) -> CoreResult<()> {
        self.check_available()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn save_rule(&self, rule: &AlertRuleDefinition) -> CoreResult<()> {
        self.check_available()?;
        self.rules
            .write()
            .await
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> CoreResult<bool> {
        self.check_available()?;
        Ok(self.rules.write().await.remove(rule_id).is_some())
    }

    async fn load_rules(&self) -> CoreResult<Vec<AlertRuleDefinition>> {
        self.check_available()?;
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn save_station(&self, station_id: &str) -> CoreResult<()> {
        self.check_available()?;
        self.stations.write().await.insert(station_id.to_string());
        Ok(())
    }

    async fn load_stations(&self) -> CoreResult<Vec<String>> {
        self.check_available()?;
        Ok(self.stations.read().await.iter().cloned().collect())
    }
}
