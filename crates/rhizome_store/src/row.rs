//! Row-to-record mapping for the jobs table.

use chrono::{DateTime, Utc};
use rhizome_ids::{JobId, WorkerId};
use rhizome_protocol::{
    CostEstimate, ErrorKind, IngestOptions, Job, JobError, JobInput, JobKind, JobProgress,
    JobResult, JobStatus,
};
use sqlx::FromRow;

use crate::error::StoreError;

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub content_fingerprint: String,
    pub ontology: String,
    pub input_ref: String,
    pub options_json: String,
    pub status: String,
    pub progress_json: Option<String>,
    pub cost_estimate_json: Option<String>,
    pub result_json: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub cancellation_requested: bool,
    pub owner_principal: String,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job, StoreError> {
        let corrupt = |detail: String| StoreError::CorruptRecord {
            job_id: self.id.clone(),
            detail,
        };

        let id = JobId::parse(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let kind =
            JobKind::parse(&self.kind).ok_or_else(|| corrupt(format!("bad kind {:?}", self.kind)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("bad status {:?}", self.status)))?;
        let input: JobInput = serde_json::from_str(&self.input_ref)
            .map_err(|e| corrupt(format!("input_ref: {e}")))?;
        let options: IngestOptions = serde_json::from_str(&self.options_json)
            .map_err(|e| corrupt(format!("options_json: {e}")))?;

        let progress: Option<JobProgress> = self
            .progress_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("progress_json: {e}")))?;
        let cost_estimate: Option<CostEstimate> = self
            .cost_estimate_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("cost_estimate_json: {e}")))?;
        let result: Option<JobResult> = self
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("result_json: {e}")))?;

        let error = match (&self.error_kind, &self.error_message) {
            (Some(kind), message) => Some(JobError {
                kind: ErrorKind::parse(kind)
                    .ok_or_else(|| corrupt(format!("bad error_kind {kind:?}")))?,
                message: message.clone().unwrap_or_default(),
            }),
            (None, _) => None,
        };

        let worker_id = self
            .worker_id
            .as_deref()
            .map(WorkerId::parse)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Job {
            id,
            kind,
            content_fingerprint: self.content_fingerprint,
            ontology: self.ontology,
            input,
            options,
            status,
            progress,
            cost_estimate,
            result,
            error,
            cancellation_requested: self.cancellation_requested,
            owner: self.owner_principal,
            worker_id,
            lease_expires_at: self.lease_expires_at,
            retry_count: self.retry_count,
            created_at: self.created_at,
            approved_at: self.approved_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_progress_at: self.last_progress_at,
        })
    }
}
