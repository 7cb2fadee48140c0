//! The scheduler loop.
//!
//! One owning struct drives the whole lifecycle on a housekeeping tick:
//! cost estimation for queued jobs, pre-start cancellation sweeps, approval
//! TTL expiry, lease reaping, and claiming under `MAX_CONCURRENT_JOBS`.
//! Workers report their own terminal transitions; the scheduler only
//! watches their cancellation flags and their task handles.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use rhizome_ids::JobId;
use rhizome_protocol::JobStatus;
use rhizome_store::JobFilter;
use rhizome_worker::{estimate_job, CancellationToken, IngestionRunner, WorkerContext};

use crate::submit::SubmitService;

struct RunningJob {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Scheduler {
    ctx: WorkerContext,
    submit: SubmitService,
    embedding_model: String,
}

impl Scheduler {
    pub fn new(ctx: WorkerContext) -> Self {
        let submit = SubmitService::new(Arc::clone(&ctx.store), Arc::clone(&ctx.config));
        let embedding_model = ctx.embedder.active_config().model;
        Self {
            ctx,
            submit,
            embedding_model,
        }
    }

    /// The submission surface bound to this scheduler's store.
    pub fn submit_service(&self) -> &SubmitService {
        &self.submit
    }

    pub async fn run(&self) -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        // Hold the sender so the channel stays open for the whole run.
        let result = self.run_with_shutdown(rx).await;
        drop(_tx);
        result
    }

    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.startup_recovery().await?;

        let mut running: HashMap<JobId, RunningJob> = HashMap::new();
        let mut ticker = tokio::time::interval(self.ctx.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_prune = tokio::time::Instant::now();

        info!(
            max_concurrent = self.ctx.config.max_concurrent_jobs,
            "Scheduler running"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut running, &mut last_prune).await;
                }
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        break;
                    }
                }
            }
        }

        // Leave claimed jobs to lease recovery: aborting here is
        // indistinguishable from a crash, which the reaper already handles.
        for (job_id, job) in running {
            warn!(job_id = %job_id, "Shutdown with job in flight; lease recovery will requeue it");
            job.handle.abort();
        }
        Ok(())
    }

    /// On process start: reclaim expired leases. Jobs in `processing` with
    /// valid leases belong to live workers elsewhere and are left alone;
    /// queued jobs without estimates are picked up by the estimator pump.
    async fn startup_recovery(&self) -> Result<()> {
        let reaped = self
            .ctx
            .store
            .reap_expired_leases(Utc::now(), self.ctx.config.max_job_retries)
            .await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Startup recovery reaped expired leases");
        }
        Ok(())
    }

    async fn tick(
        &self,
        running: &mut HashMap<JobId, RunningJob>,
        last_prune: &mut tokio::time::Instant,
    ) {
        self.sweep_cancellations().await;
        self.pump_estimates().await;
        self.expire_overdue_approvals().await;
        self.reap_leases().await;
        self.watch_running(running).await;
        self.claim_capacity(running).await;

        if last_prune.elapsed() > std::time::Duration::from_secs(60) {
            *last_prune = tokio::time::Instant::now();
            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.ctx.config.retention_window)
                    .unwrap_or_else(|_| chrono::Duration::days(7));
            if let Err(e) = self.ctx.store.prune_terminal(cutoff).await {
                warn!(error = %e, "Retention pruning failed");
            }
        }
    }

    /// Finalize cancellation for jobs that had not started yet.
    async fn sweep_cancellations(&self) {
        let pending = match self.ctx.store.list_cancel_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Cancellation sweep query failed");
                return;
            }
        };
        for job in pending {
            match self
                .ctx
                .store
                .update_status(&job.id, &[job.status], JobStatus::Cancelled, "cancel sweep")
                .await
            {
                Ok(_) => debug!(job_id = %job.id, "Cancelled pre-start job"),
                Err(e) => debug!(job_id = %job.id, error = %e, "Cancel sweep lost a race"),
            }
        }
    }

    /// Estimate queued jobs and move them to `awaiting_approval`;
    /// auto-approve the ones that asked for it.
    async fn pump_estimates(&self) {
        let queued = match self
            .ctx
            .store
            .list(&JobFilter {
                status: Some(JobStatus::Queued),
                ..Default::default()
            })
            .await
        {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "Estimator queue query failed");
                return;
            }
        };

        for job in queued {
            if job.cancellation_requested {
                continue;
            }
            if job.cost_estimate.is_none() {
                let estimate =
                    match estimate_job(&job, &self.ctx.config, &self.embedding_model).await {
                        Ok(estimate) => estimate,
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Cost estimation failed, will retry");
                            continue;
                        }
                    };
                if let Err(e) = self.ctx.store.set_cost_estimate(&job.id, &estimate).await {
                    warn!(job_id = %job.id, error = %e, "Storing cost estimate failed");
                    continue;
                }
                debug!(job_id = %job.id, usd = estimate.usd_total, "Cost estimate stored");
            }
            match self
                .ctx
                .store
                .update_status(
                    &job.id,
                    &[JobStatus::Queued],
                    JobStatus::AwaitingApproval,
                    "estimated",
                )
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "Estimate transition lost a race");
                    continue;
                }
            }
            if job.options.auto_approve {
                if let Err(e) = self.submit.approve_job(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "Auto-approval refused");
                }
            }
        }
    }

    async fn expire_overdue_approvals(&self) {
        let ttl = match chrono::Duration::from_std(self.ctx.config.approval_ttl) {
            Ok(ttl) => ttl,
            Err(_) => return,
        };
        let overdue = match self.ctx.store.list_approval_overdue(Utc::now() - ttl).await {
            Ok(overdue) => overdue,
            Err(e) => {
                warn!(error = %e, "Approval TTL query failed");
                return;
            }
        };
        for job in overdue {
            match self
                .ctx
                .store
                .update_status(
                    &job.id,
                    &[JobStatus::AwaitingApproval],
                    JobStatus::Expired,
                    "approval TTL exceeded",
                )
                .await
            {
                Ok(_) => info!(job_id = %job.id, "Job expired awaiting approval"),
                Err(e) => debug!(job_id = %job.id, error = %e, "Expiry lost a race"),
            }
        }
    }

    async fn reap_leases(&self) {
        if let Err(e) = self
            .ctx
            .store
            .reap_expired_leases(Utc::now(), self.ctx.config.max_job_retries)
            .await
        {
            warn!(error = %e, "Lease reaping failed");
        }
    }

    /// Drop finished handles and propagate cancellation flags to running
    /// workers' tokens.
    async fn watch_running(&self, running: &mut HashMap<JobId, RunningJob>) {
        running.retain(|_, job| !job.handle.is_finished());
        for (job_id, job) in running.iter() {
            if job.token.is_cancelled() {
                continue;
            }
            match self.ctx.store.get(job_id).await {
                Ok(record) if record.cancellation_requested => {
                    info!(job_id = %job_id, "Propagating cancellation to worker");
                    job.token.cancel();
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Running-job status check failed"),
            }
        }
    }

    /// Claim approved jobs FIFO until the concurrency budget is full.
    async fn claim_capacity(&self, running: &mut HashMap<JobId, RunningJob>) {
        while running.len() < self.ctx.config.max_concurrent_jobs {
            let claimed = match self
                .ctx
                .store
                .claim_next(&self.ctx.worker_id, self.ctx.config.lease_duration)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "Claim failed");
                    return;
                }
            };
            let Some(job) = claimed else {
                return;
            };

            let token = CancellationToken::new();
            if job.cancellation_requested {
                token.cancel();
            }
            let job_id = job.id.clone();
            let runner = IngestionRunner::new(self.ctx.clone());
            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                runner.run_job(job, task_token).await;
            });
            running.insert(job_id, RunningJob { token, handle });
        }
    }
}
