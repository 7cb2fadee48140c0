//! Job execution.
//!
//! One runner executes one claimed job: chunks run under bounded
//! parallelism, every chunk commits its graph writes as one transaction,
//! progress is monotonic, and the lease is renewed both on progress and on
//! a background heartbeat. Cancellation is observed at every safe point.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rhizome_graph::{
    ChunkBatch, ConceptLink, ConceptProposal, ConceptRelationship, ConceptResolver, GraphError,
    NewInstance, RelationType, SourceNode, UpsertEngine,
};
use rhizome_ids::{InstanceId, JobId, WorkerId};
use rhizome_protocol::{
    ErrorKind, ExtractionProfile, GraphCounters, Job, JobInput, JobProgress, JobResult, JobStatus,
    SystemConfig,
};
use rhizome_protocol::config::defaults;
use rhizome_protocol::profiles::pricing_for;
use rhizome_providers::{
    with_retries, Embedder, ExtractRequest, Extractor, KnownConcept, ProviderError, RetryPolicy,
    TokenUsage,
};
use rhizome_store::JobStore;

use crate::cancel::CancellationToken;
use crate::chunker::{chunk_text, Chunk};
use crate::validate::validate_extraction;

/// Everything a worker needs, captured at startup. In-flight jobs keep the
/// configuration they started with.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub engine: Arc<UpsertEngine>,
    pub resolver: Arc<ConceptResolver>,
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Arc<dyn Embedder>,
    pub config: Arc<SystemConfig>,
    pub worker_id: WorkerId,
}

pub struct IngestionRunner {
    ctx: WorkerContext,
}

#[derive(Debug)]
struct JobFailure {
    kind: ErrorKind,
    message: String,
}

enum RunOutcome {
    Completed(JobResult),
    Cancelled,
}

#[derive(Default)]
struct RunState {
    processed: u32,
    failed: Vec<(u32, String)>,
    counters: GraphCounters,
    usage: TokenUsage,
    context: Vec<KnownConcept>,
}

struct ChunkEnv {
    store: Arc<JobStore>,
    engine: Arc<UpsertEngine>,
    resolver: Arc<ConceptResolver>,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    config: Arc<SystemConfig>,
    job_id: JobId,
    worker_id: WorkerId,
    ontology: String,
    document: String,
    chunks_total: u32,
    partial_failures: bool,
    profile: ExtractionProfile,
    cancel: CancellationToken,
    abort: CancellationToken,
    state: StdMutex<RunState>,
}

impl IngestionRunner {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Execute one claimed job to a terminal transition. Never panics the
    /// caller; every path ends in complete/fail/cancelled on the store.
    pub async fn run_job(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id.clone();
        debug_assert_eq!(job.status, JobStatus::Processing);

        let heartbeat = self.spawn_lease_heartbeat(&job_id, &cancel);
        let outcome = self.execute(&job, &cancel).await;
        heartbeat.abort();

        let store = &self.ctx.store;
        let worker_id = &self.ctx.worker_id;
        match outcome {
            Ok(RunOutcome::Completed(result)) => {
                info!(job_id = %job_id, chunks = result.chunks_processed, "Job completed");
                if let Err(e) = store.complete(&job_id, worker_id, &result).await {
                    error!(job_id = %job_id, error = %e, "Failed to record completion");
                }
            }
            Ok(RunOutcome::Cancelled) => {
                info!(job_id = %job_id, "Job cancelled cooperatively");
                if let Err(e) = store.finish_cancelled(&job_id, worker_id).await {
                    error!(job_id = %job_id, error = %e, "Failed to record cancellation");
                }
            }
            Err(failure) => {
                warn!(job_id = %job_id, kind = %failure.kind, message = %failure.message, "Job failed");
                if let Err(e) = store
                    .fail(&job_id, worker_id, failure.kind, &failure.message)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "Failed to record failure");
                }
            }
        }
    }

    /// Renew the lease on a cadence independent of chunk progress, so one
    /// slow extractor call cannot let the lease lapse. Losing the lease
    /// flips the cancellation token: the job now belongs to someone else.
    fn spawn_lease_heartbeat(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.ctx.store);
        let job_id = job_id.clone();
        let worker_id = self.ctx.worker_id.clone();
        let cancel = cancel.clone();
        let lease = self.ctx.config.lease_duration;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 3);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.renew_lease(&job_id, &worker_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lease no longer held, stopping work");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Lease renewal errored");
                    }
                }
            }
        })
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, JobFailure> {
        let ctx = &self.ctx;

        let text = load_input(&job.input).await?;
        let chunks = chunk_text(&text, job.options.target_words, job.options.overlap_words);
        let chunks_total = chunks.len() as u32;

        let profile = resolve_profile(job, &ctx.config)?;
        let document = document_name(job);

        // Empty content is a trivially successful job.
        if chunks.is_empty() {
            return Ok(RunOutcome::Completed(JobResult {
                chunks_total: 0,
                chunks_processed: 0,
                chunks_failed: 0,
                counters: GraphCounters::default(),
                tokens_in: 0,
                tokens_out: 0,
                usd_total: 0.0,
                note: None,
            }));
        }

        let progress = JobProgress::new("extracting", chunks_total);
        if let Err(e) = ctx.store.update_progress(&job.id, &progress).await {
            warn!(job_id = %job.id, error = %e, "Initial progress write failed");
        }

        let env = Arc::new(ChunkEnv {
            store: Arc::clone(&ctx.store),
            engine: Arc::clone(&ctx.engine),
            resolver: Arc::clone(&ctx.resolver),
            extractor: Arc::clone(&ctx.extractor),
            embedder: Arc::clone(&ctx.embedder),
            config: Arc::clone(&ctx.config),
            job_id: job.id.clone(),
            worker_id: ctx.worker_id.clone(),
            ontology: job.ontology.clone(),
            document,
            chunks_total,
            partial_failures: job.options.partial_failures,
            profile,
            cancel: cancel.clone(),
            abort: CancellationToken::new(),
            state: StdMutex::new(RunState::default()),
        });

        let semaphore = Arc::new(Semaphore::new(ctx.config.max_chunk_concurrency.max(1)));
        let mut tasks: JoinSet<Result<(), JobFailure>> = JoinSet::new();

        // Chunks are started in document order; the semaphore bounds how
        // many are in flight at once. Waiting for a slot races against
        // cancellation so no further chunks start once the job is stopped.
        for chunk in chunks {
            let acquired = tokio::select! {
                _ = env.cancel.cancelled() => None,
                _ = env.abort.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => Some(permit),
            };
            let Some(acquired) = acquired else { break };
            let permit = acquired.map_err(|e| JobFailure {
                kind: ErrorKind::Permanent,
                message: format!("chunk semaphore closed: {e}"),
            })?;
            let env = Arc::clone(&env);
            tasks.spawn(async move {
                let _permit = permit;
                process_chunk(env, chunk).await
            });
        }

        let mut fatal: Option<JobFailure> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    env.abort.cancel();
                    if fatal.is_none() {
                        fatal = Some(failure);
                    }
                }
                Err(join_error) => {
                    env.abort.cancel();
                    if fatal.is_none() {
                        fatal = Some(JobFailure {
                            kind: ErrorKind::Permanent,
                            message: format!("chunk task aborted: {join_error}"),
                        });
                    }
                }
            }
        }

        if env.cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        if let Some(failure) = fatal {
            return Err(failure);
        }

        let state = env.state.lock().unwrap_or_else(|e| e.into_inner());
        let prices = pricing_for(&env.profile.model);
        let usd_total = (state.usage.input as f64 / 1000.0) * prices.usd_per_1k_input
            + (state.usage.output as f64 / 1000.0) * prices.usd_per_1k_output;
        let note = (!state.failed.is_empty()).then(|| {
            format!(
                "{} chunk(s) skipped under partial-failure policy: {}",
                state.failed.len(),
                state
                    .failed
                    .iter()
                    .map(|(idx, msg)| format!("#{idx}: {msg}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        });

        Ok(RunOutcome::Completed(JobResult {
            chunks_total,
            chunks_processed: state.processed,
            chunks_failed: state.failed.len() as u32,
            counters: state.counters,
            tokens_in: state.usage.input,
            tokens_out: state.usage.output,
            usd_total,
            note,
        }))
    }
}

// ----------------------------------------------------------------------
// Per-chunk pipeline
// ----------------------------------------------------------------------

async fn process_chunk(env: Arc<ChunkEnv>, chunk: Chunk) -> Result<(), JobFailure> {
    let source_id = SourceNode::source_id(&env.document, chunk.index, job_key(&env.job_id));

    // A chunk whose source already exists was fully committed by an earlier
    // run of this job (the batch is one transaction); count it and move on.
    match env.engine.source_exists(&source_id).await {
        Ok(true) => {
            debug!(job_id = %env.job_id, chunk = chunk.index, "Chunk already committed, skipping");
            record_progress(&env, |state| state.processed += 1).await;
            return Ok(());
        }
        Ok(false) => {}
        Err(e) => {
            return chunk_failed(&env, chunk.index, ErrorKind::Transient, e.to_string());
        }
    }

    if env.cancel.is_cancelled() || env.abort.is_cancelled() {
        return Ok(());
    }

    let policy = RetryPolicy {
        max_attempts: env.config.chunk_retry_limit,
        ..Default::default()
    };
    let is_cancelled = || env.cancel.is_cancelled() || env.abort.is_cancelled();

    // Extraction, with the known-concepts context snapshotted up front.
    let context_snapshot: Vec<KnownConcept> = {
        let state = env.state.lock().unwrap_or_else(|e| e.into_inner());
        state.context.clone()
    };
    let extraction = with_retries(&policy, "extract", is_cancelled, |attempt| {
        let request = ExtractRequest {
            chunk_text: &chunk.text,
            context: &context_snapshot,
            profile: &env.profile,
            strict_reminder: attempt.strict,
        };
        let extractor = Arc::clone(&env.extractor);
        let timeout = env.config.extractor_timeout;
        let cancel = env.cancel.clone();
        let abort = env.abort.clone();
        async move {
            // Cancellation aborts the in-flight call, not just the next
            // safe point.
            tokio::select! {
                _ = cancel.cancelled() => {
                    Err(ProviderError::Permanent("cancelled during extraction".into()))
                }
                _ = abort.cancelled() => {
                    Err(ProviderError::Permanent("stopped during extraction".into()))
                }
                result = tokio::time::timeout(timeout, extractor.extract(request)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient("extractor call timed out".into())),
                }
            }
        }
    })
    .await;
    let outcome = match extraction {
        Ok(outcome) => outcome,
        Err(e) => {
            if is_cancelled() {
                return Ok(());
            }
            return chunk_failed(&env, chunk.index, e.kind(), e.to_string());
        }
    };

    if let Err(failure) = validate_extraction(&outcome.result, &chunk.text) {
        return chunk_failed(&env, chunk.index, ErrorKind::InvalidOutput, failure.to_string());
    }

    if is_cancelled() {
        return Ok(());
    }

    // Embeddings for every extracted concept label.
    let labels: Vec<String> = outcome
        .result
        .concepts
        .iter()
        .map(|c| c.label.clone())
        .collect();
    let embeddings = if labels.is_empty() {
        Vec::new()
    } else {
        let embedded = with_retries(&policy, "embed", is_cancelled, |_| {
            let embedder = Arc::clone(&env.embedder);
            let labels = labels.clone();
            let timeout = env.config.embedder_timeout;
            let cancel = env.cancel.clone();
            let abort = env.abort.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(ProviderError::Permanent("cancelled during embedding".into()))
                    }
                    _ = abort.cancelled() => {
                        Err(ProviderError::Permanent("stopped during embedding".into()))
                    }
                    result = tokio::time::timeout(timeout, embedder.embed(&labels)) => match result {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Transient("embedder call timed out".into())),
                    }
                }
            }
        })
        .await;
        match embedded {
            Ok(vectors) => vectors,
            Err(e) => {
                if is_cancelled() {
                    return Ok(());
                }
                return chunk_failed(&env, chunk.index, e.kind(), e.to_string());
            }
        }
    };
    if embeddings.len() != outcome.result.concepts.len() {
        return chunk_failed(
            &env,
            chunk.index,
            ErrorKind::Permanent,
            format!(
                "embedder returned {} vectors for {} concepts",
                embeddings.len(),
                outcome.result.concepts.len()
            ),
        );
    }

    // Identity resolution, one proposal at a time; the resolver serializes
    // create decisions per ontology internally.
    let mut links: Vec<ConceptLink> = Vec::with_capacity(outcome.result.concepts.len());
    let mut resolution: std::collections::HashMap<String, String> = Default::default();
    let mut created: Vec<KnownConcept> = Vec::new();
    for (concept, embedding) in outcome.result.concepts.iter().zip(embeddings) {
        let proposal = ConceptProposal {
            proposed_id: concept.concept_id.clone(),
            label: concept.label.clone(),
            search_terms: concept.search_terms.clone(),
            embedding,
        };
        let resolved = match env.resolver.resolve(&env.ontology, &proposal).await {
            Ok(resolved) => resolved,
            Err(e) => {
                return chunk_failed(&env, chunk.index, graph_error_kind(&e), e.to_string());
            }
        };
        if resolved.created {
            created.push(KnownConcept {
                id: resolved.concept_id.clone(),
                label: concept.label.clone(),
                search_terms: concept.search_terms.clone(),
            });
        }
        resolution.insert(concept.concept_id.clone(), resolved.concept_id.clone());
        links.push(ConceptLink {
            concept_id: resolved.concept_id,
            created: resolved.created,
        });
    }

    // Assemble the batch in resolved-id space.
    let mut instances = Vec::with_capacity(outcome.result.instances.len());
    for instance in &outcome.result.instances {
        instances.push(NewInstance {
            id: InstanceId::new(),
            concept_id: resolution[&instance.concept_id].clone(),
            quote: instance.quote.clone(),
        });
    }
    let mut relationships = Vec::with_capacity(outcome.result.relationships.len());
    for rel in &outcome.result.relationships {
        let rel_type = match RelationType::parse(&rel.rel_type) {
            Ok(rel_type) => rel_type,
            Err(e) => {
                return chunk_failed(&env, chunk.index, ErrorKind::InvalidOutput, e.to_string());
            }
        };
        relationships.push(ConceptRelationship {
            from_concept: resolution[&rel.from_concept_id].clone(),
            to_concept: resolution[&rel.to_concept_id].clone(),
            rel_type,
            confidence: rel.confidence,
        });
    }

    let batch = ChunkBatch {
        source: SourceNode {
            id: source_id,
            document: env.document.clone(),
            chunk_index: chunk.index,
            full_text: chunk.text.clone(),
            word_count: chunk.word_count,
            ontology: env.ontology.clone(),
        },
        concept_links: links,
        instances,
        relationships,
    };

    let commit = with_retries(&policy, "graph-commit", is_cancelled, |_| {
        let engine = Arc::clone(&env.engine);
        let batch = batch.clone();
        let timeout = env.config.graph_timeout;
        async move {
            match tokio::time::timeout(timeout, engine.apply_chunk(&batch)).await {
                Ok(Ok(stats)) => Ok(stats),
                Ok(Err(GraphError::Backend(message))) => Err(ProviderError::Transient(message)),
                Ok(Err(other)) => Err(ProviderError::Permanent(other.to_string())),
                Err(_) => Err(ProviderError::Transient("graph commit timed out".into())),
            }
        }
    })
    .await;
    let stats = match commit {
        Ok(stats) => stats,
        Err(e) => {
            if is_cancelled() {
                return Ok(());
            }
            return chunk_failed(&env, chunk.index, e.kind(), e.to_string());
        }
    };

    record_progress(&env, |state| {
        state.processed += 1;
        state.counters.accumulate(&stats);
        state.usage.accumulate(outcome.usage);
        for concept in created {
            if state.context.len() >= defaults::EXTRACTION_CONTEXT_CAP {
                state.context.remove(0);
            }
            state.context.push(concept);
        }
    })
    .await;

    Ok(())
}

/// Mutate shared run state, then push a progress snapshot and renew the
/// lease. Store failures are logged, not fatal; the snapshot is monotonic
/// so a lost write is caught up by the next one.
async fn record_progress(env: &Arc<ChunkEnv>, mutate: impl FnOnce(&mut RunState)) {
    let snapshot = {
        let mut state = env.state.lock().unwrap_or_else(|e| e.into_inner());
        mutate(&mut state);
        JobProgress {
            stage: "extracting".to_string(),
            chunks_total: env.chunks_total,
            chunks_processed: state.processed,
            percent: JobProgress::compute_percent(state.processed, env.chunks_total),
            counters: state.counters,
        }
    };
    if let Err(e) = env.store.update_progress(&env.job_id, &snapshot).await {
        warn!(job_id = %env.job_id, error = %e, "Progress write failed");
    }
    match env
        .store
        .renew_lease(&env.job_id, &env.worker_id, env.config.lease_duration)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            warn!(job_id = %env.job_id, "Lease lost during progress update");
            env.cancel.cancel();
        }
        Err(e) => warn!(job_id = %env.job_id, error = %e, "Lease renewal errored"),
    }
}

/// Apply the chunk-failure policy: record and continue under partial mode,
/// fail the job under strict mode (the default).
fn chunk_failed(
    env: &Arc<ChunkEnv>,
    chunk_index: u32,
    kind: ErrorKind,
    message: String,
) -> Result<(), JobFailure> {
    warn!(
        job_id = %env.job_id,
        chunk = chunk_index,
        kind = %kind,
        %message,
        "Chunk failed"
    );
    if env.partial_failures {
        let mut state = env.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failed.push((chunk_index, message));
        Ok(())
    } else {
        // Strict mode: stop sibling chunks as soon as possible.
        env.abort.cancel();
        Err(JobFailure {
            kind: ErrorKind::ExtractionFailed,
            message: format!("chunk {chunk_index}: {message}"),
        })
    }
}

fn graph_error_kind(error: &GraphError) -> ErrorKind {
    match error {
        GraphError::Backend(_) => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

async fn load_input(input: &JobInput) -> Result<String, JobFailure> {
    match input {
        JobInput::Inline { text } => Ok(text.clone()),
        JobInput::Blob { path, .. } => {
            tokio::fs::read_to_string(path).await.map_err(|e| JobFailure {
                kind: ErrorKind::Permanent,
                message: format!("failed to read staged input {path:?}: {e}"),
            })
        }
    }
}

fn resolve_profile(job: &Job, config: &SystemConfig) -> Result<ExtractionProfile, JobFailure> {
    let selector = job
        .options
        .profile
        .as_deref()
        .unwrap_or(&config.default_profile);
    ExtractionProfile::lookup(selector).ok_or_else(|| JobFailure {
        kind: ErrorKind::Validation,
        message: format!("unknown extraction profile {selector:?}"),
    })
}

/// Short job discriminator folded into source ids.
pub fn job_key(job_id: &JobId) -> &str {
    let id = job_id.as_str();
    &id[..id.len().min(8)]
}

/// Display name the Source nodes hang off: explicit filename, staged blob
/// name, or a stable synthetic name for anonymous inline text.
fn document_name(job: &Job) -> String {
    if let Some(name) = job.options.filename.as_deref() {
        return name.to_string();
    }
    if let Some(name) = job.input.filename() {
        return name.to_string();
    }
    let id = job.id.as_str();
    format!("inline-{}", &id[..id.len().min(8)])
}
