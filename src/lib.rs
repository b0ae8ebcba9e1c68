//! Weather station ingestion, aggregation and alerting engine.
//!
//! Modules follow the Explicit Module Boundary Pattern (EMBP): each
//! directory module is a gateway that re-exports what its siblings need and
//! keeps everything else private.

pub mod alert;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod models;
pub mod publish;
pub mod query;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::{Config, EngineConfig};
pub use engine::{Engine, HealthReport};
pub use error::{CoreError, CoreResult};
