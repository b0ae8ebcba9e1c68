//! Report ingestion: normalization followed by per-station sequential
//! application to the store, cache, publisher and alert evaluator.

mod normalizer;
mod pipeline;

pub use normalizer::{Normalizer, StationRegistry};
pub use pipeline::IngestPipeline;
