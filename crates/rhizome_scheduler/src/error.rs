//! Submission-surface errors.
//!
//! Only validation and conflicts surface to submitters; everything else a
//! job hits is discovered through `get_job`.

use rhizome_ids::JobId;
use rhizome_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for SubmitError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { job_id } => Self::NotFound(job_id),
            StoreError::StaleState {
                job_id,
                expected,
                actual,
            } => Self::Conflict(format!(
                "job {job_id} is {actual}, expected one of {expected:?}"
            )),
            StoreError::IllegalTransition { job_id, from, to } => {
                Self::Conflict(format!("job {job_id}: illegal transition {from} -> {to}"))
            }
            other => Self::Store(other),
        }
    }
}
