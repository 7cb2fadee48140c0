//! Job store error types.

use rhizome_ids::JobId;
use rhizome_protocol::JobStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {job_id} not found")]
    NotFound { job_id: JobId },

    #[error("job {job_id} is {actual}, expected one of {expected:?}")]
    StaleState {
        job_id: JobId,
        expected: Vec<JobStatus>,
        actual: JobStatus,
    },

    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("corrupt job record {job_id}: {detail}")]
    CorruptRecord { job_id: String, detail: String },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
}
