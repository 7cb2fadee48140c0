//! Submission service: submit, approve, cancel, get, list.

use std::sync::Arc;
use tracing::{debug, info};

use rhizome_ids::JobId;
use rhizome_protocol::config::defaults;
use rhizome_protocol::{
    fingerprint, ExtractionProfile, IngestOptions, Job, JobInput, JobKind, JobStatus, SystemConfig,
};
use rhizome_store::{JobFilter, JobStore, NewJob};

use crate::error::SubmitError;

pub struct SubmitService {
    store: Arc<JobStore>,
    config: Arc<SystemConfig>,
}

/// Result of `submit_ingestion`: either a fresh job or the existing job a
/// non-forced duplicate resolved to.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Created(Job),
    /// No job was created; submission matched this one.
    Duplicate(Job),
}

impl SubmitOutcome {
    pub fn job(&self) -> &Job {
        match self {
            Self::Created(job) | Self::Duplicate(job) => job,
        }
    }

    pub fn duplicate_of(&self) -> Option<&JobId> {
        match self {
            Self::Created(_) => None,
            Self::Duplicate(job) => Some(&job.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: bool,
    /// Status at the moment of the request: pre-start statuses mean the
    /// cancel is guaranteed, `processing` means cooperative.
    pub at_status: JobStatus,
}

impl SubmitService {
    pub fn new(store: Arc<JobStore>, config: Arc<SystemConfig>) -> Self {
        Self { store, config }
    }

    /// Submit one document for ingestion. Idempotent under identical
    /// (content, ontology, chunk options) unless `force` is set.
    pub async fn submit_ingestion(
        &self,
        content: String,
        ontology: &str,
        options: IngestOptions,
        owner: &str,
    ) -> Result<SubmitOutcome, SubmitError> {
        if ontology.trim().is_empty() {
            return Err(SubmitError::Validation("ontology must not be empty".into()));
        }
        options
            .validate()
            .map_err(SubmitError::Validation)?;
        if let Some(profile) = options.profile.as_deref() {
            if ExtractionProfile::lookup(profile).is_none() {
                return Err(SubmitError::Validation(format!(
                    "unknown extraction profile {profile:?}"
                )));
            }
        }

        let digest = fingerprint(
            &content,
            ontology,
            options.target_words,
            options.overlap_words,
        );

        if !options.force {
            if let Some(existing) = self
                .store
                .find_latest_by_fingerprint(&digest.to_hex())
                .await?
            {
                debug!(job_id = %existing.id, "Duplicate submission resolved to existing job");
                return Ok(SubmitOutcome::Duplicate(existing));
            }
        }

        // A forced re-ingest is stored under a salted digest so it never
        // shadows (or is shadowed by) the original in duplicate lookups.
        let stored_digest = if options.force {
            digest.with_random_salt()
        } else {
            digest
        };

        let input = self.stage_input(content, &options, &stored_digest.to_hex()).await?;
        let job = self
            .store
            .create(NewJob {
                kind: JobKind::Ingestion,
                content_fingerprint: stored_digest.to_hex(),
                ontology: ontology.to_string(),
                input,
                options,
                owner: owner.to_string(),
                cost_estimate: None,
            })
            .await?;
        info!(job_id = %job.id, ontology, owner, "Submitted ingestion job");
        Ok(SubmitOutcome::Created(job))
    }

    /// Inline small submissions; stage large ones as blob files.
    async fn stage_input(
        &self,
        content: String,
        options: &IngestOptions,
        digest_hex: &str,
    ) -> Result<JobInput, SubmitError> {
        if content.len() <= self.config.inline_input_limit {
            return Ok(JobInput::Inline { text: content });
        }
        let dir = &self.config.blob_root;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SubmitError::Internal(anyhow::anyhow!("blob dir: {e}")))?;
        let path = dir.join(digest_hex);
        let bytes = content.len() as u64;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SubmitError::Internal(anyhow::anyhow!("blob write: {e}")))?;
        Ok(JobInput::Blob {
            path: path.to_string_lossy().to_string(),
            filename: options
                .filename
                .clone()
                .unwrap_or_else(|| "upload.txt".to_string()),
            bytes,
        })
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job, SubmitError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, SubmitError> {
        Ok(self.store.list(filter).await?)
    }

    /// `awaiting_approval -> approved`. Re-checks the dedup invariant at
    /// the gate: approving is refused while another job with the same
    /// fingerprint is approved, processing, or completed.
    pub async fn approve_job(&self, id: &JobId) -> Result<Job, SubmitError> {
        let job = self.store.get(id).await?;
        if job.status != JobStatus::AwaitingApproval {
            return Err(SubmitError::Conflict(format!(
                "job {id} is {}, expected awaiting_approval",
                job.status
            )));
        }
        if self
            .store
            .competing_exists_for_fingerprint(&job.content_fingerprint, id)
            .await?
        {
            return Err(SubmitError::Conflict(format!(
                "another job with the same content is already running or completed; \
                 resubmit with force to re-ingest (job {id})"
            )));
        }
        let job = self
            .store
            .update_status(
                id,
                &[JobStatus::AwaitingApproval],
                JobStatus::Approved,
                "approved",
            )
            .await?;
        Ok(job)
    }

    /// Request cancellation. Pre-start jobs transition immediately; a
    /// processing job is cancelled cooperatively by its worker. Terminal
    /// jobs are left untouched.
    pub async fn cancel_job(&self, id: &JobId) -> Result<CancelOutcome, SubmitError> {
        let at_status = self.store.request_cancellation(id).await?;
        if at_status.is_terminal() {
            return Ok(CancelOutcome {
                cancelled: false,
                at_status,
            });
        }
        if matches!(
            at_status,
            JobStatus::Queued | JobStatus::AwaitingApproval | JobStatus::Approved
        ) {
            match self
                .store
                .update_status(
                    id,
                    &[at_status],
                    JobStatus::Cancelled,
                    defaults::CANCELLED_BY_USER_MESSAGE,
                )
                .await
            {
                Ok(_) => {}
                // Lost the race with a claim or the scheduler's sweep; the
                // flag is set, so cancellation completes cooperatively.
                Err(rhizome_store::StoreError::StaleState { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(CancelOutcome {
            cancelled: true,
            at_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> SubmitService {
        let store = Arc::new(JobStore::open_in_memory().await.unwrap());
        let config = Arc::new(SystemConfig::with_home(
            tempfile::tempdir().unwrap().into_path(),
        ));
        SubmitService::new(store, config)
    }

    fn options() -> IngestOptions {
        IngestOptions::default()
    }

    #[tokio::test]
    async fn test_submit_creates_queued_job() {
        let service = service().await;
        let outcome = service
            .submit_ingestion("hello world".into(), "notes", options(), "me")
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(outcome.duplicate_of().is_none());
        assert!(matches!(job.input, JobInput::Inline { .. }));
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let service = service().await;
        let err = service
            .submit_ingestion("text".into(), "  ", options(), "me")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));

        let mut bad = options();
        bad.overlap_words = bad.target_words;
        let err = service
            .submit_ingestion("text".into(), "notes", bad, "me")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));

        let mut bad = options();
        bad.profile = Some("nope".into());
        let err = service
            .submit_ingestion("text".into(), "notes", bad, "me")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_existing() {
        let service = service().await;
        let first = service
            .submit_ingestion("same text".into(), "notes", options(), "me")
            .await
            .unwrap();
        let second = service
            .submit_ingestion("same text".into(), "notes", options(), "me")
            .await
            .unwrap();
        assert_eq!(second.duplicate_of(), Some(&first.job().id));

        // One job in the store, not two.
        let jobs = service.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_same_text_different_ontology_is_distinct() {
        let service = service().await;
        let first = service
            .submit_ingestion("same text".into(), "notes", options(), "me")
            .await
            .unwrap();
        let second = service
            .submit_ingestion("same text".into(), "papers", options(), "me")
            .await
            .unwrap();
        assert!(second.duplicate_of().is_none());
        assert_ne!(first.job().id, second.job().id);
    }

    #[tokio::test]
    async fn test_force_creates_new_with_salted_fingerprint() {
        let service = service().await;
        let first = service
            .submit_ingestion("same text".into(), "notes", options(), "me")
            .await
            .unwrap();

        let mut forced = options();
        forced.force = true;
        let second = service
            .submit_ingestion("same text".into(), "notes", forced, "me")
            .await
            .unwrap();
        assert!(second.duplicate_of().is_none());
        assert_ne!(
            first.job().content_fingerprint,
            second.job().content_fingerprint
        );
    }

    #[tokio::test]
    async fn test_large_submission_staged_as_blob() {
        let service = service().await;
        let big = "word ".repeat(200_000);
        let outcome = service
            .submit_ingestion(big.clone(), "notes", options(), "me")
            .await
            .unwrap();
        match &outcome.job().input {
            JobInput::Blob { path, bytes, .. } => {
                assert_eq!(*bytes, big.len() as u64);
                let read_back = tokio::fs::read_to_string(path).await.unwrap();
                assert_eq!(read_back, big);
            }
            other => panic!("expected blob input, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_approve_requires_awaiting_approval() {
        let service = service().await;
        let outcome = service
            .submit_ingestion("text".into(), "notes", options(), "me")
            .await
            .unwrap();
        let err = service.approve_job(&outcome.job().id).await.unwrap_err();
        assert!(matches!(err, SubmitError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_prestart_is_immediate() {
        let service = service().await;
        let outcome = service
            .submit_ingestion("text".into(), "notes", options(), "me")
            .await
            .unwrap();
        let cancel = service.cancel_job(&outcome.job().id).await.unwrap();
        assert!(cancel.cancelled);
        assert_eq!(cancel.at_status, JobStatus::Queued);

        let job = service.get_job(&outcome.job().id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let service = service().await;
        let outcome = service
            .submit_ingestion("text".into(), "notes", options(), "me")
            .await
            .unwrap();
        service.cancel_job(&outcome.job().id).await.unwrap();
        let again = service.cancel_job(&outcome.job().id).await.unwrap();
        assert!(!again.cancelled);
        assert_eq!(again.at_status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let service = service().await;
        let err = service.get_job(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }
}
