//! Job store operations.
//!
//! Claiming uses the transactional SELECT-then-conditional-UPDATE shape so
//! that at most one worker wins a given job even with many claimants racing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rhizome_ids::{JobId, WorkerId};
use rhizome_protocol::{
    CostEstimate, ErrorKind, IngestOptions, Job, JobInput, JobKind, JobProgress, JobResult,
    JobStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::row::JobRow;
use crate::schema;

pub struct JobStore {
    pool: Pool<Sqlite>,
}

/// Inputs for job creation. The store assigns id, status, and `created_at`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub content_fingerprint: String,
    pub ontology: String,
    pub input: JobInput,
    pub options: IngestOptions,
    pub owner: String,
    pub cost_estimate: Option<CostEstimate>,
}

/// Listing filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct QueueStats {
    pub queued: i64,
    pub awaiting_approval: i64,
    pub approved: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub expired: i64,
}

/// What the reaper did to one expired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    Requeued { job_id: JobId, retry_count: i32 },
    Failed { job_id: JobId },
}

impl JobStore {
    /// Open (and migrate) the store backed by a SQLite file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Pinned to one connection so every query
    /// sees the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Creation and reads
    // ------------------------------------------------------------------

    /// Insert a new job. Lands in `queued`, or directly in
    /// `awaiting_approval` when the cost estimate is already attached.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        let id = JobId::new();
        let status = if new.cost_estimate.is_some() {
            JobStatus::AwaitingApproval
        } else {
            JobStatus::Queued
        };
        let now = Utc::now();

        let cost_json = new
            .cost_estimate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO rz_jobs
                (id, kind, content_fingerprint, ontology, input_ref, options_json,
                 status, cost_estimate_json, cancellation_requested, owner_principal,
                 retry_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(new.kind.as_str())
        .bind(&new.content_fingerprint)
        .bind(&new.ontology)
        .bind(serde_json::to_string(&new.input)?)
        .bind(serde_json::to_string(&new.options)?)
        .bind(status.as_str())
        .bind(cost_json)
        .bind(&new.owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(job_id = %id, ontology = %new.ontology, status = %status, "Created job");
        self.get(&id).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM rz_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.into_job(),
            None => Err(StoreError::NotFound { job_id: id.clone() }),
        }
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM rz_jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(owner) = &filter.owner {
            builder.push(" AND owner_principal = ").push_bind(owner);
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at < ").push_bind(before);
        }
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows: Vec<JobRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Most recent job carrying this fingerprint, if any.
    pub async fn find_latest_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT * FROM rz_jobs WHERE content_fingerprint = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Conditional transition. Fails with `StaleState` when the job's
    /// current status is not in `from_set`, and `IllegalTransition` for an
    /// edge outside the state machine. Entry into `processing` is reserved
    /// for `claim_next`.
    pub async fn update_status(
        &self,
        id: &JobId,
        from_set: &[JobStatus],
        to: JobStatus,
        reason: &str,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM rz_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let row = row.ok_or_else(|| StoreError::NotFound { job_id: id.clone() })?;
        let actual = JobStatus::parse(&row.status).ok_or_else(|| StoreError::CorruptRecord {
            job_id: row.id.clone(),
            detail: format!("bad status {:?}", row.status),
        })?;

        if !from_set.contains(&actual) {
            return Err(StoreError::StaleState {
                job_id: id.clone(),
                expected: from_set.to_vec(),
                actual,
            });
        }
        if to == JobStatus::Processing || !actual.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                job_id: id.clone(),
                from: actual,
                to,
            });
        }

        let now = Utc::now();
        match to {
            JobStatus::Approved => {
                // Keeps the original approved_at when a reaped job re-enters
                // the queue, preserving FIFO position.
                sqlx::query(
                    r#"
                    UPDATE rz_jobs
                    SET status = ?, approved_at = COALESCE(approved_at, ?),
                        worker_id = NULL, lease_expires_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(to.as_str())
                .bind(now)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            }
            s if s.is_terminal() => {
                sqlx::query(
                    r#"
                    UPDATE rz_jobs
                    SET status = ?, completed_at = ?,
                        worker_id = NULL, lease_expires_at = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(to.as_str())
                .bind(now)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                sqlx::query("UPDATE rz_jobs SET status = ? WHERE id = ?")
                    .bind(to.as_str())
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        info!(job_id = %id, from = %actual, to = %to, reason, "Job transition");
        self.get(id).await
    }

    /// Monotonic progress write. A snapshot older than what is stored is
    /// dropped (readers must tolerate stale percents anyway). Returns
    /// whether the write was applied.
    pub async fn update_progress(&self, id: &JobId, progress: &JobProgress) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(Option<String>, String)> =
            sqlx::query_as("SELECT progress_json, status FROM rz_jobs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let (current_json, _status) =
            current.ok_or_else(|| StoreError::NotFound { job_id: id.clone() })?;

        if let Some(json) = current_json.as_deref() {
            let existing: JobProgress = serde_json::from_str(json)?;
            if progress.chunks_processed < existing.chunks_processed {
                debug!(
                    job_id = %id,
                    stored = existing.chunks_processed,
                    incoming = progress.chunks_processed,
                    "Dropping stale progress snapshot"
                );
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query("UPDATE rz_jobs SET progress_json = ?, last_progress_at = ? WHERE id = ?")
            .bind(serde_json::to_string(progress)?)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Attach the pre-approval cost estimate. Only legal while the job is
    /// still `queued` or `awaiting_approval`.
    pub async fn set_cost_estimate(&self, id: &JobId, estimate: &CostEstimate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status = self.status_in_tx(&mut tx, id).await?;
        if !matches!(status, JobStatus::Queued | JobStatus::AwaitingApproval) {
            return Err(StoreError::StaleState {
                job_id: id.clone(),
                expected: vec![JobStatus::Queued, JobStatus::AwaitingApproval],
                actual: status,
            });
        }
        sqlx::query("UPDATE rz_jobs SET cost_estimate_json = ? WHERE id = ?")
            .bind(serde_json::to_string(estimate)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record the cancellation request and report the status the job was in
    /// at that moment, so callers can tell pre-start (guaranteed) from
    /// in-flight (cooperative) cancellation.
    pub async fn request_cancellation(&self, id: &JobId) -> Result<JobStatus> {
        let mut tx = self.pool.begin().await?;
        let status = self.status_in_tx(&mut tx, id).await?;
        if !status.is_terminal() {
            sqlx::query("UPDATE rz_jobs SET cancellation_requested = 1 WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(status)
    }

    // ------------------------------------------------------------------
    // Worker protocol: claim, lease, terminal reports
    // ------------------------------------------------------------------

    /// Atomically claim the oldest approved job: transition it to
    /// `processing`, stamp `started_at`, the owning worker, and a lease.
    /// Returns `None` when nothing is claimable.
    pub async fn claim_next(
        &self,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let job_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM rz_jobs
            WHERE status = 'approved' AND cancellation_requested = 0
            ORDER BY approved_at ASC, created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let lease = now + chrono_duration(lease_duration);
        let rows_affected = sqlx::query(
            r#"
            UPDATE rz_jobs
            SET status = 'processing',
                worker_id = ?,
                lease_expires_at = ?,
                started_at = COALESCE(started_at, ?)
            WHERE id = ? AND status = 'approved'
            "#,
        )
        .bind(worker_id.as_str())
        .bind(lease)
        .bind(now)
        .bind(&job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Another worker won the race between SELECT and UPDATE.
            tx.commit().await?;
            return Ok(None);
        }

        let row: JobRow = sqlx::query_as("SELECT * FROM rz_jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let job = row.into_job()?;
        info!(job_id = %job.id, worker_id = %worker_id, "Claimed job");
        Ok(Some(job))
    }

    /// Extend the lease if this worker still owns the processing job.
    pub async fn renew_lease(
        &self,
        id: &JobId,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> Result<bool> {
        let lease = Utc::now() + chrono_duration(lease_duration);
        let rows = sqlx::query(
            r#"
            UPDATE rz_jobs
            SET lease_expires_at = ?
            WHERE id = ? AND worker_id = ? AND status = 'processing'
            "#,
        )
        .bind(lease)
        .bind(id.as_str())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Terminal success, reported by the owning worker.
    pub async fn complete(&self, id: &JobId, worker_id: &WorkerId, result: &JobResult) -> Result<()> {
        self.finish(
            id,
            worker_id,
            JobStatus::Completed,
            Some(serde_json::to_string(result)?),
            None,
        )
        .await
    }

    /// Terminal failure, reported by the owning worker.
    pub async fn fail(
        &self,
        id: &JobId,
        worker_id: &WorkerId,
        kind: ErrorKind,
        message: &str,
    ) -> Result<()> {
        self.finish(
            id,
            worker_id,
            JobStatus::Failed,
            None,
            Some((kind, message.to_string())),
        )
        .await
    }

    /// Cooperative cancellation observed by the owning worker. Partial
    /// progress stays on the record.
    pub async fn finish_cancelled(&self, id: &JobId, worker_id: &WorkerId) -> Result<()> {
        self.finish(id, worker_id, JobStatus::Cancelled, None, None).await
    }

    async fn finish(
        &self,
        id: &JobId,
        worker_id: &WorkerId,
        to: JobStatus,
        result_json: Option<String>,
        error: Option<(ErrorKind, String)>,
    ) -> Result<()> {
        debug_assert!(to.is_terminal());
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, worker_id FROM rz_jobs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let (status, owner) = row.ok_or_else(|| StoreError::NotFound { job_id: id.clone() })?;
        let actual = JobStatus::parse(&status).ok_or_else(|| StoreError::CorruptRecord {
            job_id: id.to_string(),
            detail: format!("bad status {status:?}"),
        })?;

        // A reaped-and-reclaimed job no longer belongs to this worker; its
        // late report must not clobber the new owner's run.
        if actual != JobStatus::Processing || owner.as_deref() != Some(worker_id.as_str()) {
            return Err(StoreError::StaleState {
                job_id: id.clone(),
                expected: vec![JobStatus::Processing],
                actual,
            });
        }

        let (error_kind, error_message) = match &error {
            Some((kind, message)) => (Some(kind.as_str()), Some(message.as_str())),
            None => (None, None),
        };
        sqlx::query(
            r#"
            UPDATE rz_jobs
            SET status = ?, result_json = ?, error_kind = ?, error_message = ?,
                completed_at = ?, worker_id = NULL, lease_expires_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(result_json)
        .bind(error_kind)
        .bind(error_message)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(job_id = %id, status = %to, "Job finished");
        Ok(())
    }

    /// Return expired `processing` jobs to `approved` for another claim, or
    /// terminal-fail them as WorkerLost once the retry budget is spent.
    pub async fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<Vec<ReapOutcome>> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT id, retry_count FROM rz_jobs
            WHERE status = 'processing' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut outcomes = Vec::with_capacity(expired.len());
        for (raw_id, retry_count) in expired {
            let job_id = JobId::parse(&raw_id).map_err(|e| StoreError::CorruptRecord {
                job_id: raw_id.clone(),
                detail: e.to_string(),
            })?;
            if retry_count < max_retries {
                sqlx::query(
                    r#"
                    UPDATE rz_jobs
                    SET status = 'approved', worker_id = NULL, lease_expires_at = NULL,
                        retry_count = retry_count + 1
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(&raw_id)
                .execute(&mut *tx)
                .await?;
                warn!(job_id = %job_id, retry = retry_count + 1, "Lease expired, requeued");
                outcomes.push(ReapOutcome::Requeued {
                    job_id,
                    retry_count: retry_count + 1,
                });
            } else {
                sqlx::query(
                    r#"
                    UPDATE rz_jobs
                    SET status = 'failed', worker_id = NULL, lease_expires_at = NULL,
                        error_kind = 'worker_lost',
                        error_message = 'lease expired beyond retry budget',
                        completed_at = ?
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(now)
                .bind(&raw_id)
                .execute(&mut *tx)
                .await?;
                warn!(job_id = %job_id, "Lease expired beyond retry budget, failed");
                outcomes.push(ReapOutcome::Failed { job_id });
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'awaiting_approval') AS awaiting_approval,
                COUNT(*) FILTER (WHERE status = 'approved') AS approved,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired
            FROM rz_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Delete terminal jobs whose `completed_at` is before the cutoff.
    pub async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            DELETE FROM rz_jobs
            WHERE status IN ('completed', 'failed', 'cancelled', 'expired')
              AND completed_at IS NOT NULL AND completed_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows > 0 {
            info!(pruned = rows, "Pruned terminal jobs");
        }
        Ok(rows)
    }

    /// Jobs in `awaiting_approval` created before the cutoff, for TTL
    /// expiry by the scheduler.
    pub async fn list_approval_overdue(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM rz_jobs WHERE status = 'awaiting_approval' AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Pre-start jobs whose cancellation flag is set; the scheduler
    /// finalizes these to `cancelled` on its next tick.
    pub async fn list_cancel_pending(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM rz_jobs
            WHERE cancellation_requested = 1
              AND status IN ('queued', 'awaiting_approval', 'approved')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// True when another job with this fingerprint is completed or on the
    /// way there (approved/processing). Guards the approval gate so two
    /// identical non-forced submissions cannot both run to completion.
    pub async fn competing_exists_for_fingerprint(
        &self,
        fingerprint: &str,
        exclude: &JobId,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM rz_jobs
            WHERE content_fingerprint = ? AND id != ?
              AND status IN ('approved', 'processing', 'completed')
            "#,
        )
        .bind(fingerprint)
        .bind(exclude.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn status_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        id: &JobId,
    ) -> Result<JobStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM rz_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        let status = status.ok_or_else(|| StoreError::NotFound { job_id: id.clone() })?;
        JobStatus::parse(&status).ok_or_else(|| StoreError::CorruptRecord {
            job_id: id.to_string(),
            detail: format!("bad status {status:?}"),
        })
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(fingerprint: &str) -> NewJob {
        NewJob {
            kind: JobKind::Ingestion,
            content_fingerprint: fingerprint.to_string(),
            ontology: "notes".to_string(),
            input: JobInput::Inline {
                text: "hello world".to_string(),
            },
            options: IngestOptions::default(),
            owner: "tests".to_string(),
            cost_estimate: None,
        }
    }

    fn estimate() -> CostEstimate {
        CostEstimate {
            tokens_in: 1000,
            tokens_out: 500,
            usd_extraction: 0.01,
            usd_embedding: 0.001,
            usd_total: 0.011,
            model_ids: vec!["gpt-4o-mini".to_string()],
        }
    }

    async fn approved_job(store: &JobStore) -> Job {
        let job = store.create(new_job("fp-a")).await.unwrap();
        store.set_cost_estimate(&job.id, &estimate()).await.unwrap();
        store
            .update_status(
                &job.id,
                &[JobStatus::Queued],
                JobStatus::AwaitingApproval,
                "estimated",
            )
            .await
            .unwrap();
        store
            .update_status(
                &job.id,
                &[JobStatus::AwaitingApproval],
                JobStatus::Approved,
                "approved",
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_starts_queued() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = store.create(new_job("fp")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.cost_estimate.is_none());
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_create_with_estimate_awaits_approval() {
        let store = JobStore::open_in_memory().await.unwrap();
        let mut new = new_job("fp");
        new.cost_estimate = Some(estimate());
        let job = store.create(new).await.unwrap();
        assert_eq!(job.status, JobStatus::AwaitingApproval);
        assert!(job.cost_estimate.is_some());
    }

    #[tokio::test]
    async fn test_update_status_rejects_wrong_from_set() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = store.create(new_job("fp")).await.unwrap();
        let err = store
            .update_status(
                &job.id,
                &[JobStatus::AwaitingApproval],
                JobStatus::Approved,
                "premature",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_update_status_rejects_machine_violation() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = store.create(new_job("fp")).await.unwrap();
        // queued -> approved is not an edge even if the caller claims it.
        let err = store
            .update_status(&job.id, &[JobStatus::Queued], JobStatus::Approved, "skip")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_claim_next_fifo_and_stamps() {
        let store = JobStore::open_in_memory().await.unwrap();
        let first = approved_job(&store).await;
        let _second = approved_job(&store).await;

        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert!(claimed.lease_expires_at.is_some());
        assert_eq!(claimed.worker_id.as_ref(), Some(&worker));
    }

    #[tokio::test]
    async fn test_claim_next_empty_queue() {
        let store = JobStore::open_in_memory().await.unwrap();
        let worker = WorkerId::new();
        assert!(store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_cancellation_requested() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = approved_job(&store).await;
        store.request_cancellation(&job.id).await.unwrap();

        let worker = WorkerId::new();
        assert!(store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_owning_worker() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let stranger = WorkerId::new();
        let result = JobResult {
            chunks_total: 1,
            chunks_processed: 1,
            chunks_failed: 0,
            counters: Default::default(),
            tokens_in: 10,
            tokens_out: 5,
            usd_total: 0.001,
            note: None,
        };
        let err = store
            .complete(&claimed.id, &stranger, &result)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));

        store.complete(&claimed.id, &worker, &result).await.unwrap();
        let job = store.get(&claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        store
            .fail(&claimed.id, &worker, ErrorKind::ExtractionFailed, "chunk 2 failed")
            .await
            .unwrap();
        let job = store.get(&claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ExtractionFailed);
        assert_eq!(error.message, "chunk 2 failed");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let mut progress = JobProgress::new("extracting", 10);
        progress.chunks_processed = 4;
        assert!(store.update_progress(&claimed.id, &progress).await.unwrap());

        progress.chunks_processed = 2;
        assert!(!store.update_progress(&claimed.id, &progress).await.unwrap());

        let job = store.get(&claimed.id).await.unwrap();
        assert_eq!(job.progress.unwrap().chunks_processed, 4);
        assert!(job.last_progress_at.is_some());
    }

    #[tokio::test]
    async fn test_cost_estimate_gated_by_status() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = approved_job(&store).await;
        let err = store.set_cost_estimate(&job.id, &estimate()).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_request_cancellation_reports_status() {
        let store = JobStore::open_in_memory().await.unwrap();
        let job = store.create(new_job("fp")).await.unwrap();
        let at_status = store.request_cancellation(&job.id).await.unwrap();
        assert_eq!(at_status, JobStatus::Queued);
        assert!(store.get(&job.id).await.unwrap().cancellation_requested);
    }

    #[tokio::test]
    async fn test_reap_requeues_then_fails() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(0))
            .await
            .unwrap()
            .unwrap();

        // First expiry: back to approved with retry_count bumped.
        let future = Utc::now() + ChronoDuration::seconds(10);
        let outcomes = store.reap_expired_leases(future, 1).await.unwrap();
        assert_eq!(
            outcomes,
            vec![ReapOutcome::Requeued {
                job_id: claimed.id.clone(),
                retry_count: 1
            }]
        );
        let job = store.get(&claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Approved);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at.is_some());

        // Reclaim and expire again: budget exhausted, WorkerLost.
        let claimed = store
            .claim_next(&worker, Duration::from_secs(0))
            .await
            .unwrap()
            .unwrap();
        let outcomes = store.reap_expired_leases(future, 1).await.unwrap();
        assert_eq!(outcomes, vec![ReapOutcome::Failed { job_id: claimed.id.clone() }]);
        let job = store.get(&claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, ErrorKind::WorkerLost);
    }

    #[tokio::test]
    async fn test_renew_lease_requires_ownership() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .renew_lease(&claimed.id, &worker, Duration::from_secs(600))
            .await
            .unwrap());
        let stranger = WorkerId::new();
        assert!(!store
            .renew_lease(&claimed.id, &stranger, Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fingerprint_lookup_latest() {
        let store = JobStore::open_in_memory().await.unwrap();
        let first = store.create(new_job("same-fp")).await.unwrap();
        let second = store.create(new_job("same-fp")).await.unwrap();
        // Tie-break on equal timestamps is unspecified; both are valid
        // "most recent" answers. Just check we get one of them back.
        let found = store
            .find_latest_by_fingerprint("same-fp")
            .await
            .unwrap()
            .unwrap();
        assert!(found.id == first.id || found.id == second.id);
        assert!(store
            .find_latest_by_fingerprint("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = JobStore::open_in_memory().await.unwrap();
        let a = store.create(new_job("fp-1")).await.unwrap();
        let mut other_owner = new_job("fp-2");
        other_owner.owner = "someone-else".to_string();
        store.create(other_owner).await.unwrap();

        let filter = JobFilter {
            owner: Some("tests".to_string()),
            ..Default::default()
        };
        let jobs = store.list(&filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);

        let filter = JobFilter {
            status: Some(JobStatus::Queued),
            ..Default::default()
        };
        assert_eq!(store.list(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let store = JobStore::open_in_memory().await.unwrap();
        store.create(new_job("fp-1")).await.unwrap();
        let _ = approved_job(&store).await;
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_competing_fingerprint_gate() {
        let store = JobStore::open_in_memory().await.unwrap();
        let a = store.create(new_job("shared-fp")).await.unwrap();
        let b = store.create(new_job("shared-fp")).await.unwrap();

        // Nothing approved yet: no competitor.
        assert!(!store
            .competing_exists_for_fingerprint("shared-fp", &b.id)
            .await
            .unwrap());

        store.set_cost_estimate(&a.id, &estimate()).await.unwrap();
        store
            .update_status(&a.id, &[JobStatus::Queued], JobStatus::AwaitingApproval, "est")
            .await
            .unwrap();
        store
            .update_status(&a.id, &[JobStatus::AwaitingApproval], JobStatus::Approved, "ok")
            .await
            .unwrap();

        assert!(store
            .competing_exists_for_fingerprint("shared-fp", &b.id)
            .await
            .unwrap());
        // A job never competes with itself.
        assert!(!store
            .competing_exists_for_fingerprint("shared-fp", &a.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_cancel_pending_prestart_only() {
        let store = JobStore::open_in_memory().await.unwrap();
        let queued = store.create(new_job("fp-1")).await.unwrap();
        store.request_cancellation(&queued.id).await.unwrap();

        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let processing = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        store.request_cancellation(&processing.id).await.unwrap();

        // Only the pre-start job shows up; the processing one is the
        // worker's to observe.
        let pending = store.list_cancel_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, queued.id);
    }

    #[tokio::test]
    async fn test_prune_terminal() {
        let store = JobStore::open_in_memory().await.unwrap();
        let _ = approved_job(&store).await;
        let worker = WorkerId::new();
        let claimed = store
            .claim_next(&worker, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        store
            .fail(&claimed.id, &worker, ErrorKind::Permanent, "boom")
            .await
            .unwrap();

        // Nothing younger than the cutoff window goes away.
        let past = Utc::now() - ChronoDuration::days(1);
        assert_eq!(store.prune_terminal(past).await.unwrap(), 0);

        let future = Utc::now() + ChronoDuration::seconds(5);
        assert_eq!(store.prune_terminal(future).await.unwrap(), 1);
        assert!(matches!(
            store.get(&claimed.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
