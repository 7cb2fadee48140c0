//! Ingestion worker.
//!
//! Executes one approved job end-to-end: load input, chunk, extract per
//! chunk under bounded parallelism, resolve concepts, upsert transactional
//! chunk batches, and report progress until a terminal transition.

pub mod cancel;
pub mod chunker;
pub mod estimator;
pub mod runner;
pub mod validate;

pub use cancel::CancellationToken;
pub use chunker::{chunk_text, Chunk};
pub use estimator::{estimate_cost, estimate_job};
pub use runner::{job_key, IngestionRunner, WorkerContext};
pub use validate::{validate_extraction, ValidationFailure};
