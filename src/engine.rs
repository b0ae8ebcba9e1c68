//! Engine facade wiring the components together.
//!
//! ```text
//! report ─▶ Normalizer ─▶ IngestPipeline ─▶ store / cache / live topics
//!                                      └──▶ ReorderBuffer ─▶ AlertEvaluator ─▶ Publisher
//! query  ─▶ AggregationEngine ─▶ CacheCoordinator ─▶ store
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::alert::{AlertEvaluator, AlertRule, RuleState};
use crate::cache::{CacheCoordinator, CacheStats};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::ingest::{IngestPipeline, Normalizer, StationRegistry};
use crate::models::{AlertRuleDefinition, Measurement, RawReport};
use crate::publish::{EventBus, Publisher, PublisherStats};
use crate::query::{AggregationEngine, QueryPage, QueryRequest};
use crate::store::{MeasurementStore, MetadataStore};

// ---

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: String,
    pub stations: usize,
    pub rules: usize,
    pub cache: CacheStats,
    pub publisher: PublisherStats,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<StationRegistry>,
    normalizer: Normalizer,
    cache: CacheCoordinator,
    query: AggregationEngine,
    evaluator: Arc<AlertEvaluator>,
    publisher: Publisher,
    pipeline: IngestPipeline,
    store: Arc<dyn MeasurementStore>,
    metadata: Arc<dyn MetadataStore>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    // ---
    /// Build the engine and restore registered stations and alert rules
    /// from the metadata store. `stations` are registered in addition.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn MeasurementStore>,
        metadata: Arc<dyn MetadataStore>,
        bus: Arc<dyn EventBus>,
        stations: &[String],
    ) -> CoreResult<Self> {
        // ---
        let registry = Arc::new(StationRegistry::new(metadata.load_stations().await?));
        for station in stations {
            if registry.register(station.clone()) {
                metadata.save_station(station).await?;
            }
        }

        let evaluator = Arc::new(AlertEvaluator::new(config.alert.clone()));
        for definition in metadata.load_rules().await? {
            let id = definition.id.clone();
            if let Err(e) = evaluator.register_rule(definition) {
                warn!(rule_id = %id, error = %e, "Skipping stored alert rule");
            }
        }

        let cache = CacheCoordinator::new(&config.cache);
        let publisher = Publisher::spawn(bus, config.publish.clone());
        let normalizer = Normalizer::new(
            Arc::clone(&registry),
            config.ingest.clock_skew_tolerance,
        );
        let query = AggregationEngine::new(
            Arc::clone(&store),
            cache.clone(),
            Arc::clone(&registry),
            config.query.clone(),
        );
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            cache.clone(),
            Arc::clone(&registry),
            Arc::clone(&evaluator),
            publisher.clone(),
            config.ingest.queue_capacity,
            config.alert.reorder_window,
        );

        info!(
            stations = registry.list().len(),
            rules = evaluator.list_rules().len(),
            "Engine started"
        );

        Ok(Self {
            config,
            registry,
            normalizer,
            cache,
            query,
            evaluator,
            publisher,
            pipeline,
            store,
            metadata,
            maintenance: Mutex::new(Vec::new()),
        })
    }

    /// Validate a report without side effects.
    pub fn normalize(&self, raw: &RawReport) -> CoreResult<Measurement> {
        self.normalizer.normalize(raw)
    }

    /// Normalize and apply a report; returns the stored measurement.
    #[instrument(skip_all, fields(station = raw.station_hint().unwrap_or("-")))]
    pub async fn ingest(&self, raw: &RawReport) -> CoreResult<Measurement> {
        // ---
        let measurement = self.normalizer.normalize(raw).map_err(|e| {
            if e.is_recoverable_ingest() {
                info!(error = %e, "Report rejected");
            }
            e
        })?;
        self.pipeline.submit(measurement).await
    }

    pub async fn query(&self, request: QueryRequest) -> CoreResult<QueryPage> {
        self.query.query(request).await
    }

    pub async fn latest(&self, station_id: &str) -> CoreResult<Option<Measurement>> {
        self.query.latest(station_id).await
    }

    /// Validate, persist and activate a rule. Re-registering an id replaces it.
    pub async fn register_rule(
        &self,
        definition: AlertRuleDefinition,
    ) -> CoreResult<Arc<AlertRule>> {
        // ---
        AlertRule::compile(definition.clone(), &self.config.alert)?;
        self.metadata.save_rule(&definition).await?;
        self.evaluator.register_rule(definition)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> CoreResult<()> {
        // ---
        self.evaluator.get_rule(rule_id)?;
        self.metadata.delete_rule(rule_id).await?;
        self.evaluator.remove_rule(rule_id)
    }

    pub fn list_rules(&self) -> Vec<Arc<AlertRule>> {
        self.evaluator.list_rules()
    }

    pub fn get_rule(&self, rule_id: &str) -> CoreResult<Arc<AlertRule>> {
        self.evaluator.get_rule(rule_id)
    }

    pub fn rule_state(&self, rule_id: &str, station_id: &str) -> CoreResult<RuleState> {
        self.evaluator.rule_state(rule_id, station_id)
    }

    pub fn rule_states(
        &self,
        rule_id: &str,
    ) -> CoreResult<std::collections::BTreeMap<String, RuleState>> {
        self.evaluator.rule_states(rule_id)
    }

    /// Register a station; returns `false` if it was already known.
    pub async fn register_station(&self, station_id: &str) -> CoreResult<bool> {
        // ---
        let id = station_id.trim();
        if id.is_empty() || id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(CoreError::malformed(format!(
                "invalid station id '{station_id}'"
            )));
        }
        if self.registry.is_known(id) {
            return Ok(false);
        }
        self.metadata.save_station(id).await?;
        Ok(self.registry.register(id))
    }

    pub fn stations(&self) -> Vec<String> {
        self.registry.list()
    }

    pub async fn health(&self) -> HealthReport {
        // ---
        let store = match self.store.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        HealthReport {
            status: if store == "ok" { "ok" } else { "degraded" },
            store,
            stations: self.registry.list().len(),
            rules: self.evaluator.list_rules().len(),
            cache: self.cache.stats(),
            publisher: self.publisher.stats(),
        }
    }

    /// Start background cache expiry.
    pub fn spawn_maintenance(&self) {
        // ---
        let sweeper = self.cache.spawn_sweeper(self.config.cache.sweep_interval);
        self.maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sweeper);
    }

    /// Push every buffered measurement through rule evaluation.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    /// Drain ingestion and publishing, then stop background tasks.
    pub async fn shutdown(&self) {
        // ---
        self.pipeline.shutdown().await;
        self.publisher.shutdown().await;
        for task in std::mem::take(&mut *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()))
        {
            task.abort();
        }
        info!("Engine stopped");
    }
}
