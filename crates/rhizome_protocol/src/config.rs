//! System configuration captured at startup.
//!
//! Workers keep the configuration they started with; changing the embedding
//! configuration mid-flight would mix vector dimensions in one graph, so a
//! reload requires a worker-pool restart.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Canonical default values shared across the control plane.
pub mod defaults {
    use std::time::Duration;

    pub const MAX_CONCURRENT_JOBS: usize = 4;
    pub const MAX_CHUNK_CONCURRENCY: usize = 2;
    pub const MATCH_THRESHOLD: f32 = 0.85;
    pub const SEARCH_TERM_JACCARD: f32 = 0.5;
    pub const LEASE_DURATION: Duration = Duration::from_secs(300);
    pub const MAX_JOB_RETRIES: i32 = 3;
    pub const CHUNK_RETRY_LIMIT: u32 = 5;
    pub const APPROVAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const RETENTION_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    pub const EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(120);
    pub const EMBEDDER_TIMEOUT: Duration = Duration::from_secs(10);
    pub const GRAPH_TIMEOUT: Duration = Duration::from_secs(30);
    /// Submissions above this many bytes are staged as blob files.
    pub const INLINE_INPUT_LIMIT: usize = 256 * 1024;
    pub const TICK_INTERVAL: Duration = Duration::from_millis(250);
    /// A processing job with no progress for this long is displayed as
    /// stalled. Display-only; the lease reaper is the authority.
    pub const STALL_THRESHOLD: Duration = Duration::from_secs(30);
    /// Known-concept context handed to the extractor, capped.
    pub const EXTRACTION_CONTEXT_CAP: usize = 50;
    pub const DB_FILE: &str = "rhizome.db";
    pub const BLOBS_DIR: &str = "blobs";
    pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
}

/// What to do when the vector match misses but search terms overlap
/// (resolver step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Reuse the overlapping concept (logs a potential-duplicate event).
    #[default]
    Reuse,
    /// Log the potential duplicate but create a new concept anyway.
    CreateNew,
}

/// Immutable configuration value captured at worker startup.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// SQLite file backing the job store.
    pub db_path: PathBuf,
    /// Directory for staged blob inputs.
    pub blob_root: PathBuf,
    pub max_concurrent_jobs: usize,
    pub max_chunk_concurrency: usize,
    /// Cosine similarity at or above which a proposed concept matches an
    /// existing one.
    pub match_threshold: f32,
    /// Restrict vector matches to the submitting ontology.
    pub ontology_scoped_match: bool,
    pub search_term_fallback: FallbackPolicy,
    pub lease_duration: Duration,
    /// Lease expiries tolerated before a job terminal-fails as WorkerLost.
    pub max_job_retries: i32,
    /// Attempts per chunk before a transient failure escalates.
    pub chunk_retry_limit: u32,
    /// How long a job may sit in awaiting_approval before expiring.
    pub approval_ttl: Duration,
    /// Terminal jobs older than this may be pruned.
    pub retention_window: Duration,
    pub extractor_timeout: Duration,
    pub embedder_timeout: Duration,
    pub graph_timeout: Duration,
    pub inline_input_limit: usize,
    /// Default extraction profile id when a submission names none.
    pub default_profile: String,
    /// Cadence of the scheduler's housekeeping loop.
    pub tick_interval: Duration,
}

impl SystemConfig {
    /// Configuration rooted at a home directory (normally `~/.rhizome`).
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            db_path: home.join(defaults::DB_FILE),
            blob_root: home.join(defaults::BLOBS_DIR),
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            max_chunk_concurrency: defaults::MAX_CHUNK_CONCURRENCY,
            match_threshold: defaults::MATCH_THRESHOLD,
            ontology_scoped_match: true,
            search_term_fallback: FallbackPolicy::default(),
            lease_duration: defaults::LEASE_DURATION,
            max_job_retries: defaults::MAX_JOB_RETRIES,
            chunk_retry_limit: defaults::CHUNK_RETRY_LIMIT,
            approval_ttl: defaults::APPROVAL_TTL,
            retention_window: defaults::RETENTION_WINDOW,
            extractor_timeout: defaults::EXTRACTOR_TIMEOUT,
            embedder_timeout: defaults::EMBEDDER_TIMEOUT,
            graph_timeout: defaults::GRAPH_TIMEOUT,
            inline_input_limit: defaults::INLINE_INPUT_LIMIT,
            default_profile: crate::profiles::DEFAULT_PROFILE.to_string(),
            tick_interval: defaults::TICK_INTERVAL,
        }
    }
}
