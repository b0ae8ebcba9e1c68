//! Configuration loader for the `weatherflow` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Library users construct [`EngineConfig`] directly;
//! every section implements `Default` with the documented defaults.
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parse an optional environment variable of the given type with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional millisecond/second count into a [`Duration`].
macro_rules! parse_env_duration {
    (ms: $var_name:expr, $default_ms:expr) => {
        Duration::from_millis(parse_env!($var_name, u64, $default_ms))
    };
    (secs: $var_name:expr, $default_secs:expr) => {
        Duration::from_secs(parse_env!($var_name, u64, $default_secs))
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP shell listens on.
    pub bind_addr: SocketAddr,

    /// Stations registered at startup.
    pub stations: Vec<String>,

    /// Engine tuning knobs.
    pub engine: EngineConfig,
}

/// Tuning knobs for the core engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub ingest: IngestConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub alert: AlertConfig,
    pub publish: PublishConfig,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How far behind a station's last accepted timestamp a report may be,
    /// and how far ahead of the wall clock.
    pub clock_skew_tolerance: Duration,
    /// Capacity of each per-station work queue.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(300),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            shards: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Maximum concurrent bucket computations per query.
    pub concurrency: usize,
    pub default_timeout: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_buckets: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            default_timeout: Duration::from_millis(5000),
            default_page_size: 100,
            max_page_size: 1000,
            max_buckets: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Hold time before a measurement is released to rule evaluation.
    pub reorder_window: Duration,
    /// Hysteresis applied to rules that do not set their own.
    pub default_hysteresis: f64,
    /// Triggers within the cooldown window before suppression; 0 disables.
    pub default_suppress_after: u32,
    pub default_cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            reorder_window: Duration::from_millis(2000),
            default_hysteresis: 0.0,
            default_suppress_after: 0,
            default_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub shards: usize,
    pub alert_queue_capacity: usize,
    pub live_queue_capacity: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub retry_deadline: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            alert_queue_capacity: 256,
            live_queue_capacity: 1024,
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_millis(5000),
            retry_deadline: Duration::from_millis(30_000),
        }
    }
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `DATABASE_URL` – PostgreSQL connection string (unset: in-memory store)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `WEATHERFLOW_BIND` – listen address (default: 0.0.0.0:8080)
/// - `WEATHERFLOW_STATIONS` – comma separated station ids
/// - engine knobs: `CLOCK_SKEW_TOLERANCE_SECS`, `INGEST_*`, `CACHE_*`,
///   `QUERY_*`, `ALERT_*`, `PUBLISH_*`
///
/// Returns an error if any variable is present but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let bind_addr = parse_env!(
        "WEATHERFLOW_BIND",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );
    let stations = env::var("WEATHERFLOW_STATIONS")
        .map(|v| parse_station_list(&v))
        .unwrap_or_default();

    let ingest = IngestConfig {
        clock_skew_tolerance: parse_env_duration!(secs: "CLOCK_SKEW_TOLERANCE_SECS", 300),
        queue_capacity: parse_env!("INGEST_QUEUE_CAPACITY", usize, 64),
    };

    let cache = CacheConfig {
        ttl: parse_env_duration!(secs: "CACHE_TTL_SECS", 300),
        sweep_interval: parse_env_duration!(secs: "CACHE_SWEEP_INTERVAL_SECS", 60),
        shards: parse_env!("CACHE_SHARDS", usize, 16),
    };

    let query = QueryConfig {
        concurrency: parse_env!("QUERY_CONCURRENCY", usize, 8),
        default_timeout: parse_env_duration!(ms: "QUERY_TIMEOUT_MS", 5000),
        default_page_size: parse_env!("QUERY_DEFAULT_PAGE_SIZE", usize, 100),
        max_page_size: parse_env!("QUERY_MAX_PAGE_SIZE", usize, 1000),
        max_buckets: parse_env!("QUERY_MAX_BUCKETS", u64, 100_000),
    };

    let alert = AlertConfig {
        reorder_window: parse_env_duration!(ms: "ALERT_REORDER_WINDOW_MS", 2000),
        default_hysteresis: parse_env!("ALERT_DEFAULT_HYSTERESIS", f64, 0.0),
        default_suppress_after: parse_env!("ALERT_SUPPRESS_AFTER", u32, 0),
        default_cooldown: parse_env_duration!(secs: "ALERT_COOLDOWN_SECS", 600),
    };

    let publish = PublishConfig {
        shards: parse_env!("PUBLISH_SHARDS", usize, 4),
        alert_queue_capacity: parse_env!("PUBLISH_ALERT_QUEUE", usize, 256),
        live_queue_capacity: parse_env!("PUBLISH_LIVE_QUEUE", usize, 1024),
        retry_initial: parse_env_duration!(ms: "PUBLISH_RETRY_INITIAL_MS", 100),
        retry_max: parse_env_duration!(ms: "PUBLISH_RETRY_MAX_MS", 5000),
        retry_deadline: parse_env_duration!(ms: "PUBLISH_RETRY_DEADLINE_MS", 30_000),
    };

    let config = Config {
        db_url,
        db_pool_max,
        bind_addr,
        stations,
        engine: EngineConfig {
            ingest,
            cache,
            query,
            alert,
            publish,
        },
    };
    config.validate()?;
    Ok(config)
}

fn parse_station_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Reject values that would make the engine unusable.
    fn validate(&self) -> Result<()> {
        // ---
        let e = &self.engine;
        if e.cache.shards == 0 || e.publish.shards == 0 {
            return Err(anyhow!("CACHE_SHARDS and PUBLISH_SHARDS must be at least 1"));
        }
        if e.query.concurrency == 0 || e.ingest.queue_capacity == 0 {
            return Err(anyhow!(
                "QUERY_CONCURRENCY and INGEST_QUEUE_CAPACITY must be at least 1"
            ));
        }
        if e.query.default_page_size == 0 || e.query.default_page_size > e.query.max_page_size {
            return Err(anyhow!(
                "QUERY_DEFAULT_PAGE_SIZE must be between 1 and QUERY_MAX_PAGE_SIZE"
            ));
        }
        if !e.alert.default_hysteresis.is_finite() || e.alert.default_hysteresis < 0.0 {
            return Err(anyhow!("ALERT_DEFAULT_HYSTERESIS must be a non-negative number"));
        }
        Ok(())
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let db = self
            .db_url
            .as_deref()
            .map(mask_db_url)
            .unwrap_or_else(|| "<unset: in-memory store>".to_string());
        let e = &self.engine;

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL              : {}", db);
        tracing::info!("  DB_POOL_MAX               : {}", self.db_pool_max);
        tracing::info!("  WEATHERFLOW_BIND          : {}", self.bind_addr);
        tracing::info!("  WEATHERFLOW_STATIONS      : {:?}", self.stations);
        tracing::info!("  CLOCK_SKEW_TOLERANCE_SECS : {}", e.ingest.clock_skew_tolerance.as_secs());
        tracing::info!("  INGEST_QUEUE_CAPACITY     : {}", e.ingest.queue_capacity);
        tracing::info!("  CACHE_TTL_SECS            : {}", e.cache.ttl.as_secs());
        tracing::info!("  CACHE_SHARDS              : {}", e.cache.shards);
        tracing::info!("  QUERY_CONCURRENCY         : {}", e.query.concurrency);
        tracing::info!("  QUERY_TIMEOUT_MS          : {}", e.query.default_timeout.as_millis());
        tracing::info!("  QUERY_MAX_PAGE_SIZE       : {}", e.query.max_page_size);
        tracing::info!("  ALERT_REORDER_WINDOW_MS   : {}", e.alert.reorder_window.as_millis());
        tracing::info!("  ALERT_DEFAULT_HYSTERESIS  : {}", e.alert.default_hysteresis);
        tracing::info!("  ALERT_SUPPRESS_AFTER      : {}", e.alert.default_suppress_after);
        tracing::info!("  ALERT_COOLDOWN_SECS       : {}", e.alert.default_cooldown.as_secs());
        tracing::info!("  PUBLISH_SHARDS            : {}", e.publish.shards);
        tracing::info!("  PUBLISH_RETRY_DEADLINE_MS : {}", e.publish.retry_deadline.as_millis());
    }
}

/// Mask the password in a database URL for logging.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // `postgres://host` has its scheme colon before `//`; nothing to mask.
            if !db_url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_mask_db_url() {
        // ---
        assert_eq!(
            mask_db_url("postgres://weather:secret@db:5432/weather"),
            "postgres://weather:****@db:5432/weather"
        );
        assert_eq!(
            mask_db_url("postgres://db:5432/weather"),
            "postgres://db:5432/weather"
        );
    }

    #[test]
    fn test_parse_station_list() {
        // ---
        assert_eq!(
            parse_station_list(" KSEA, ,KPDX,"),
            vec!["KSEA".to_string(), "KPDX".to_string()]
        );
        assert!(parse_station_list("").is_empty());
    }

    #[test]
    fn test_defaults_are_valid() {
        // ---
        let cfg = Config {
            db_url: None,
            db_pool_max: 5,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            stations: vec![],
            engine: EngineConfig::default(),
        };
        assert!(cfg.validate().is_ok());
    }
}
