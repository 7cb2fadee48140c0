//! Job record, status machine, and the shapes stored alongside a job.
//!
//! All types use serde for JSON serialization with strict enum tagging.

use chrono::{DateTime, Utc};
use rhizome_ids::{JobId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Status machine
// ============================================================================

/// Job status. Transitions are restricted to the edges encoded in
/// [`JobStatus::can_transition_to`]; the store rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    AwaitingApproval,
    Approved,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "approved" => Some(Self::Approved),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Legal edges of the lifecycle state machine.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, AwaitingApproval)
                | (Queued, Cancelled)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Cancelled)
                | (AwaitingApproval, Expired)
                | (Approved, Processing)
                | (Approved, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Approved)
        )
    }

    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::AwaitingApproval,
        JobStatus::Approved,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Expired,
    ];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job kind. This crate family covers ingestion; restore jobs share the
/// queue but are executed elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Ingestion,
    Restore,
    Other,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Restore => "restore",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingestion" => Some(Self::Ingestion),
            "restore" => Some(Self::Restore),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Failure kinds recorded on jobs and carried by provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StaleState,
    Transient,
    RateLimited,
    InvalidOutput,
    Permanent,
    ExtractionFailed,
    WorkerLost,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::StaleState => "stale_state",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::InvalidOutput => "invalid_output",
            Self::Permanent => "permanent",
            Self::ExtractionFailed => "extraction_failed",
            Self::WorkerLost => "worker_lost",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validation" => Some(Self::Validation),
            "stale_state" => Some(Self::StaleState),
            "transient" => Some(Self::Transient),
            "rate_limited" => Some(Self::RateLimited),
            "invalid_output" => Some(Self::InvalidOutput),
            "permanent" => Some(Self::Permanent),
            "extraction_failed" => Some(Self::ExtractionFailed),
            "worker_lost" => Some(Self::WorkerLost),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

// ============================================================================
// Submission input & options
// ============================================================================

/// Where the document text lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    /// Text carried inline on the job record.
    Inline { text: String },
    /// Text staged as a blob file; `bytes` is the staged length.
    Blob {
        path: String,
        filename: String,
        bytes: u64,
    },
}

impl JobInput {
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::Inline { .. } => None,
            Self::Blob { filename, .. } => Some(filename),
        }
    }
}

/// Per-submission chunking and lifecycle options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Target chunk size in whitespace-separated words.
    #[serde(default = "default_target_words")]
    pub target_words: u32,
    /// Overlap between adjacent chunks, in words.
    #[serde(default = "default_overlap_words")]
    pub overlap_words: u32,
    /// Re-ingest even when the fingerprint matches an existing job.
    #[serde(default)]
    pub force: bool,
    /// Skip the awaiting_approval hold.
    #[serde(default)]
    pub auto_approve: bool,
    /// Continue past permanently failed chunks instead of failing the job.
    #[serde(default)]
    pub partial_failures: bool,
    /// Extraction profile selector; None uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Display filename for inline submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

fn default_target_words() -> u32 {
    1000
}

fn default_overlap_words() -> u32 {
    200
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            overlap_words: default_overlap_words(),
            force: false,
            auto_approve: false,
            partial_failures: false,
            profile: None,
            filename: None,
        }
    }
}

impl IngestOptions {
    /// Parameter validation applied at submission time.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_words == 0 {
            return Err("target_words must be positive".to_string());
        }
        if self.overlap_words >= self.target_words {
            return Err(format!(
                "overlap_words ({}) must be smaller than target_words ({})",
                self.overlap_words, self.target_words
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Progress, cost, result
// ============================================================================

/// Counters maintained by the worker as graph writes land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounters {
    pub concepts_created: u64,
    pub concepts_linked: u64,
    pub instances_created: u64,
    pub relationships_created: u64,
    pub sources_created: u64,
}

impl GraphCounters {
    pub fn accumulate(&mut self, other: &GraphCounters) {
        self.concepts_created += other.concepts_created;
        self.concepts_linked += other.concepts_linked;
        self.instances_created += other.instances_created;
        self.relationships_created += other.relationships_created;
        self.sources_created += other.sources_created;
    }
}

/// Progress snapshot. `chunks_processed` never decreases; readers must
/// tolerate stale percents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: String,
    pub chunks_total: u32,
    pub chunks_processed: u32,
    pub percent: u8,
    #[serde(default)]
    pub counters: GraphCounters,
}

impl JobProgress {
    pub fn new(stage: impl Into<String>, chunks_total: u32) -> Self {
        Self {
            stage: stage.into(),
            chunks_total,
            chunks_processed: 0,
            percent: 0,
            counters: GraphCounters::default(),
        }
    }

    /// Integer percent; an empty document counts as fully processed.
    pub fn compute_percent(chunks_processed: u32, chunks_total: u32) -> u8 {
        if chunks_total == 0 {
            return 100;
        }
        ((chunks_processed as u64 * 100) / chunks_total as u64).min(100) as u8
    }
}

/// Pre-execution spend projection. Set before any approval decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub usd_extraction: f64,
    pub usd_embedding: f64,
    pub usd_total: f64,
    pub model_ids: Vec<String>,
}

/// Terminal statistics written alongside the completed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub chunks_total: u32,
    pub chunks_processed: u32,
    /// Chunks skipped under the partial-failure policy.
    pub chunks_failed: u32,
    pub counters: GraphCounters,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub usd_total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ============================================================================
// The job record
// ============================================================================

/// The full durable job record. Owned by the store; every mutation goes
/// through the store API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Hex digest over normalized content + ontology + chunk parameters.
    pub content_fingerprint: String,
    pub ontology: String,
    pub input: JobInput,
    pub options: IngestOptions,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub cancellation_requested: bool,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_tags() {
        assert_eq!(
            serde_json::to_string(&JobStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"processing\"").unwrap(),
            JobStatus::Processing
        );
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
    }

    #[test]
    fn test_transition_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Approved));
        assert!(AwaitingApproval.can_transition_to(Expired));
        assert!(Approved.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Approved)); // lease reap
        // No skips, no back-edges.
        assert!(!Queued.can_transition_to(Approved));
        assert!(!Queued.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Approved.can_transition_to(AwaitingApproval));
        assert!(!Failed.can_transition_to(Approved));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_percent_rounds_down() {
        assert_eq!(JobProgress::compute_percent(1, 3), 33);
        assert_eq!(JobProgress::compute_percent(3, 3), 100);
        assert_eq!(JobProgress::compute_percent(0, 0), 100);
    }

    #[test]
    fn test_options_validation() {
        assert!(IngestOptions::default().validate().is_ok());

        let mut opts = IngestOptions::default();
        opts.target_words = 0;
        assert!(opts.validate().is_err());

        let mut opts = IngestOptions::default();
        opts.overlap_words = opts.target_words;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_options_defaults_from_empty_json() {
        let opts: IngestOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.target_words, 1000);
        assert_eq!(opts.overlap_words, 200);
        assert!(!opts.force);
        assert!(!opts.auto_approve);
    }
}
