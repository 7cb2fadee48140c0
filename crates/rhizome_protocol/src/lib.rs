//! Shared types for the Rhizome ingestion control plane.
//!
//! Everything that crosses a crate boundary lives here: the job record and
//! its status machine, submission options, progress and cost shapes, the
//! extraction wire schema, the content fingerprint, and system configuration.

pub mod config;
pub mod extraction;
pub mod fingerprint;
pub mod profiles;
pub mod types;

pub use config::{defaults, FallbackPolicy, SystemConfig};
pub use extraction::{
    parse_extraction, ExtractedConcept, ExtractedInstance, ExtractedRelationship,
    ExtractionParseError, ExtractionResult,
};
pub use fingerprint::{fingerprint, ContentFingerprint};
pub use profiles::{pricing_for, ExtractionProfile, ModelPricing};
pub use types::{
    CostEstimate, ErrorKind, GraphCounters, IngestOptions, Job, JobError, JobInput, JobKind,
    JobProgress, JobResult, JobStatus,
};
