//! Application entry point for the `weatherflow` service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Selecting the backing store: PostgreSQL when `DATABASE_URL` is set
//!   (schema created if missing), otherwise the in-memory store
//! - Starting the engine and mounting all API routes via the `routes`
//!   gateway (EMBP pattern)
//! - Serving requests until Ctrl-C, then draining queued events
//!
//! # Environment Variables
//! - `DATABASE_URL` (optional) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `WEATHERFLOW_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `WEATHERFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use weatherflow::publish::LogBus;
use weatherflow::store::{MemoryStore, MeasurementStore, MetadataStore, PgStore};
use weatherflow::{config, routes, schema, Engine};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let (store, metadata): (Arc<dyn MeasurementStore>, Arc<dyn MetadataStore>) =
        match &cfg.db_url {
            Some(db_url) => {
                tracing::info!("Attempting to connect to database");
                let pool = PgPoolOptions::new()
                    .max_connections(cfg.db_pool_max)
                    .connect(db_url)
                    .await
                    .context("Failed to connect to database")?;
                tracing::info!("Successfully connected to database");

                schema::create_schema(&pool).await?;
                let store = Arc::new(PgStore::new(pool));
                (store.clone() as Arc<dyn MeasurementStore>, store as Arc<dyn MetadataStore>)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn MeasurementStore>, store as Arc<dyn MetadataStore>)
            }
        };

    let engine = Arc::new(
        Engine::start(
            cfg.engine.clone(),
            store,
            metadata,
            Arc::new(LogBus),
            &cfg.stations,
        )
        .await
        .context("Failed to start engine")?,
    );
    engine.spawn_maintenance();

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(Arc::clone(&engine));

    tracing::info!("Listening on {}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

// ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

/// Install the global subscriber.
///
/// Filter: `RUST_LOG` if set, else `WEATHERFLOW_LOG_LEVEL` (default
/// `debug`) with sqlx statement logging held at `warn`. Span events come
/// from `WEATHERFLOW_SPAN_EVENTS` (`full`, `enter_exit`, otherwise close
/// only) so ingest and query spans can report their timing. `FORCE_COLOR`
/// overrides TTY detection.
fn init_tracing() {
    // ---
    let env_filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directives(
            env::var("WEATHERFLOW_LOG_LEVEL").ok().as_deref(),
        )),
    };

    let span_events = match env::var("WEATHERFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let ansi = env::var("FORCE_COLOR")
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or_else(|| std::io::stdout().is_terminal());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(span_events)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .init();
}

/// Filter directives used when `RUST_LOG` is unset.
fn default_directives(level: Option<&str>) -> String {
    let level = level
        .and_then(|raw| raw.trim().parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::DEBUG);
    format!("{},sqlx::query=warn", level.to_string().to_ascii_lowercase())
}
