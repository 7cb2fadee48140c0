//! End-to-end lifecycle scenarios driven through the scheduler.
//!
//! These run the real scheduler loop against the in-memory store and the
//! embedded graph backend, with scripted providers standing in for the LLM
//! and embedder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use rhizome_graph::{ConceptResolver, GraphBackend, MemoryGraph, ResolverConfig, UpsertEngine};
use rhizome_ids::{JobId, WorkerId};
use rhizome_protocol::{ErrorKind, IngestOptions, Job, JobStatus, SystemConfig};
use rhizome_scheduler::{Scheduler, SubmitError, SubmitOutcome, SubmitService};
use rhizome_store::JobStore;
use rhizome_test_utils::{FailureScript, ScriptedExtractor, StubEmbedder};
use rhizome_worker::{chunk_text, job_key, WorkerContext};

struct Harness {
    config: Arc<SystemConfig>,
    store: Arc<JobStore>,
    graph: MemoryGraph,
    extractor: Arc<ScriptedExtractor>,
    scheduler: Arc<Scheduler>,
    shutdown: watch::Sender<bool>,
    rx: Option<watch::Receiver<bool>>,
    running: Option<JoinHandle<()>>,
}

impl Harness {
    async fn new(
        extractor: ScriptedExtractor,
        configure: impl FnOnce(&mut SystemConfig),
    ) -> Self {
        let mut config = SystemConfig::with_home(tempfile::tempdir().unwrap().into_path());
        config.tick_interval = Duration::from_millis(10);
        configure(&mut config);
        let config = Arc::new(config);

        let store = Arc::new(JobStore::open_in_memory().await.unwrap());
        let graph = MemoryGraph::new();
        let backend: Arc<dyn GraphBackend> = Arc::new(graph.clone());
        let resolver = Arc::new(ConceptResolver::new(
            Arc::clone(&backend),
            ResolverConfig {
                match_threshold: config.match_threshold,
                ontology_scoped: config.ontology_scoped_match,
                fallback: config.search_term_fallback,
                ..Default::default()
            },
        ));
        let extractor = Arc::new(extractor);

        let ctx = WorkerContext {
            store: Arc::clone(&store),
            engine: Arc::new(UpsertEngine::new(backend)),
            resolver,
            extractor: Arc::clone(&extractor) as Arc<dyn rhizome_providers::Extractor>,
            embedder: Arc::new(StubEmbedder::new(32)),
            config: Arc::clone(&config),
            worker_id: WorkerId::new(),
        };
        let scheduler = Arc::new(Scheduler::new(ctx));
        let (shutdown, rx) = watch::channel(false);

        Self {
            config,
            store,
            graph,
            extractor,
            scheduler,
            shutdown,
            rx: Some(rx),
            running: None,
        }
    }

    fn start(&mut self) {
        let scheduler = Arc::clone(&self.scheduler);
        let rx = self.rx.take().expect("scheduler already started");
        self.running = Some(tokio::spawn(async move {
            scheduler.run_with_shutdown(rx).await.unwrap();
        }));
    }

    fn submit(&self) -> &SubmitService {
        self.scheduler.submit_service()
    }

    async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.running.take() {
            let _ = handle.await;
        }
    }

    async fn wait_for(
        &self,
        id: &JobId,
        timeout: Duration,
        predicate: impl Fn(&Job) -> bool,
    ) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.store.get(id).await.unwrap();
            if predicate(&job) {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for job {id}; status={} progress={:?}",
                    job.status, job.progress
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_terminal(&self, id: &JobId, timeout: Duration) -> Job {
        self.wait_for(id, timeout, |job| job.status.is_terminal()).await
    }
}

fn filler(n: usize) -> String {
    (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
}

/// 2500 words with one extractable phrase in the middle chunk.
fn three_chunk_doc() -> String {
    format!(
        "{} Linear Scanning System {}",
        filler(1200),
        filler(1297)
    )
}

fn auto_options() -> IngestOptions {
    IngestOptions {
        auto_approve: true,
        ..Default::default()
    }
}

const LONG: Duration = Duration::from_secs(20);

// ----------------------------------------------------------------------
// Scenario 1: happy path, 3 chunks
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_three_chunks() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(three_chunk_doc(), "notes", auto_options(), "tester")
        .await
        .unwrap();
    let job_id = outcome.job().id.clone();

    let job = harness.wait_terminal(&job_id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.cost_estimate.is_some());

    let result = job.result.expect("completed job carries a result");
    assert_eq!(result.chunks_total, 3);
    assert_eq!(result.chunks_processed, 3);
    assert_eq!(result.chunks_failed, 0);
    assert_eq!(result.counters.sources_created, 3);
    assert!(result.counters.concepts_created >= 1);

    let progress = job.progress.expect("progress recorded");
    assert_eq!(progress.chunks_processed, 3);
    assert_eq!(progress.percent, 100);

    assert_eq!(harness.graph.source_ids().len(), 3);
    assert!(harness.graph.concept_count() >= 1);

    // Evidence well-formedness: every instance quote is a substring of its
    // source's full text.
    for instance in harness.graph.instances() {
        let source = harness.graph.source(&instance.source_id).unwrap();
        assert!(
            source.full_text.contains(&instance.quote),
            "quote {:?} not in source {}",
            instance.quote,
            source.id
        );
    }

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Scenario 2: duplicate submission
// ----------------------------------------------------------------------

#[tokio::test]
async fn duplicate_submission_returns_first_job() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |_| {}).await;
    harness.start();

    let first = harness
        .submit()
        .submit_ingestion(three_chunk_doc(), "notes", auto_options(), "tester")
        .await
        .unwrap();
    let first_id = first.job().id.clone();
    harness.wait_terminal(&first_id, LONG).await;

    let second = harness
        .submit()
        .submit_ingestion(three_chunk_doc(), "notes", auto_options(), "tester")
        .await
        .unwrap();
    match &second {
        SubmitOutcome::Duplicate(job) => assert_eq!(job.id, first_id),
        SubmitOutcome::Created(job) => panic!("expected duplicate, created {}", job.id),
    }

    // Only one source set was ever written.
    assert_eq!(harness.graph.source_ids().len(), 3);
    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.completed, 1);

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Scenario 3: force re-ingest
// ----------------------------------------------------------------------

#[tokio::test]
async fn force_reingest_duplicates_sources_not_concepts() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |_| {}).await;
    harness.start();

    let first = harness
        .submit()
        .submit_ingestion(three_chunk_doc(), "notes", auto_options(), "tester")
        .await
        .unwrap();
    harness.wait_terminal(&first.job().id, LONG).await;
    let concepts_after_first = harness.graph.concept_count();
    assert!(concepts_after_first >= 1);

    let mut options = auto_options();
    options.force = true;
    let second = harness
        .submit()
        .submit_ingestion(three_chunk_doc(), "notes", options, "tester")
        .await
        .unwrap();
    assert!(second.duplicate_of().is_none());
    let second_job = harness.wait_terminal(&second.job().id, LONG).await;
    assert_eq!(second_job.status, JobStatus::Completed);

    // Concepts matched, not duplicated; sources are per job.
    assert_eq!(harness.graph.concept_count(), concepts_after_first);
    assert_eq!(harness.graph.source_ids().len(), 6);
    assert_eq!(
        harness
            .graph
            .instances_for_concept("linear-scanning-system")
            .len(),
        2
    );

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Scenario 4: cancellation mid-flight
// ----------------------------------------------------------------------

#[tokio::test]
async fn cancellation_mid_flight() {
    let extractor = ScriptedExtractor::new().with_delay(Duration::from_millis(200));
    let mut harness = Harness::new(extractor, |_| {}).await;
    harness.start();

    // 10 chunks of 100 words each, no overlap.
    let mut options = auto_options();
    options.target_words = 100;
    options.overlap_words = 0;
    let outcome = harness
        .submit()
        .submit_ingestion(filler(1000), "notes", options, "tester")
        .await
        .unwrap();
    let job_id = outcome.job().id.clone();

    harness
        .wait_for(&job_id, LONG, |job| {
            job.progress
                .as_ref()
                .map_or(false, |p| p.chunks_processed >= 2)
        })
        .await;

    let cancel = harness.submit().cancel_job(&job_id).await.unwrap();
    assert!(cancel.cancelled);
    assert_eq!(cancel.at_status, JobStatus::Processing);

    let job = harness.wait_terminal(&job_id, LONG).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    // Partial progress is preserved on the record.
    assert!(job.progress.unwrap().chunks_processed >= 2);

    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.processing, 0);

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Scenario 5: worker crash recovery
// ----------------------------------------------------------------------

#[tokio::test]
async fn crash_recovery_resumes_without_rerunning_committed_chunks() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |config| {
        config.lease_duration = Duration::from_millis(100);
    })
    .await;

    // Set the job up and let a "worker" claim it, then die.
    let mut options = auto_options();
    options.filename = Some("doc.txt".to_string());
    let content = three_chunk_doc();
    let outcome = harness
        .submit()
        .submit_ingestion(content.clone(), "notes", options, "tester")
        .await
        .unwrap();
    let job_id = outcome.job().id.clone();

    // Drive estimation/approval by hand; the scheduler is not running yet.
    let estimate = rhizome_worker::estimate_job(
        &harness.store.get(&job_id).await.unwrap(),
        &harness.config,
        "hash",
    )
    .await
    .unwrap();
    harness.store.set_cost_estimate(&job_id, &estimate).await.unwrap();
    harness
        .store
        .update_status(
            &job_id,
            &[JobStatus::Queued],
            JobStatus::AwaitingApproval,
            "estimated",
        )
        .await
        .unwrap();
    harness
        .store
        .update_status(
            &job_id,
            &[JobStatus::AwaitingApproval],
            JobStatus::Approved,
            "approved",
        )
        .await
        .unwrap();

    let dead_worker = WorkerId::new();
    let claimed = harness
        .store
        .claim_next(&dead_worker, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("job claimable");
    assert_eq!(claimed.id, job_id);

    // The dead worker fully committed chunk 0 before crashing.
    let chunks = chunk_text(&content, 1000, 200);
    let engine = UpsertEngine::new(Arc::new(harness.graph.clone()) as Arc<dyn GraphBackend>);
    engine
        .apply_chunk(&rhizome_graph::ChunkBatch {
            source: rhizome_graph::SourceNode {
                id: rhizome_graph::SourceNode::source_id("doc.txt", 0, job_key(&job_id)),
                document: "doc.txt".to_string(),
                chunk_index: 0,
                full_text: chunks[0].text.clone(),
                word_count: chunks[0].word_count,
                ontology: "notes".to_string(),
            },
            concept_links: vec![],
            instances: vec![],
            relationships: vec![],
        })
        .await
        .unwrap();

    // Lease expires, then the scheduler comes up and recovers the job.
    tokio::time::sleep(Duration::from_millis(150)).await;
    harness.start();

    let job = harness.wait_terminal(&job_id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    let result = job.result.unwrap();
    assert_eq!(result.chunks_processed, 3);
    assert_eq!(result.chunks_total, 3);

    // Chunk 0 was not re-extracted; only chunks 1 and 2 hit the provider.
    assert_eq!(harness.extractor.call_count(), 2);
    assert_eq!(harness.graph.source_ids().len(), 3);

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Scenario 6: concurrent identical concepts across documents
// ----------------------------------------------------------------------

#[tokio::test]
async fn concurrent_documents_share_one_concept() {
    let extractor = ScriptedExtractor::new().with_delay(Duration::from_millis(20));
    let mut harness = Harness::new(extractor, |config| {
        config.max_concurrent_jobs = 2;
    })
    .await;
    harness.start();

    let doc_a = format!("{} Linear Scanning System {}", filler(100), filler(100));
    let doc_b = format!("{} Linear Scanning System {}", filler(90), filler(110));

    let a = harness
        .submit()
        .submit_ingestion(doc_a, "notes", auto_options(), "tester")
        .await
        .unwrap();
    let b = harness
        .submit()
        .submit_ingestion(doc_b, "notes", auto_options(), "tester")
        .await
        .unwrap();

    let job_a = harness.wait_terminal(&a.job().id, LONG).await;
    let job_b = harness.wait_terminal(&b.job().id, LONG).await;
    assert_eq!(job_a.status, JobStatus::Completed);
    assert_eq!(job_b.status, JobStatus::Completed);

    let matching: Vec<_> = harness
        .graph
        .concepts()
        .into_iter()
        .filter(|c| c.label == "Linear Scanning System")
        .collect();
    assert_eq!(matching.len(), 1, "exactly one concept node for the phrase");
    let concept_id = &matching[0].id;
    assert_eq!(harness.graph.instances_for_concept(concept_id).len(), 2);
    // Both documents are recorded on the concept.
    assert_eq!(matching[0].documents.len(), 2);

    harness.stop().await;
}

// ----------------------------------------------------------------------
// Lifecycle laws and properties
// ----------------------------------------------------------------------

#[tokio::test]
async fn manual_approval_flow_and_idempotence_laws() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(filler(100), "notes", IngestOptions::default(), "tester")
        .await
        .unwrap();
    let job_id = outcome.job().id.clone();

    // Estimation lands it in awaiting_approval with the estimate set
    // before any approval is possible.
    let job = harness
        .wait_for(&job_id, LONG, |job| {
            job.status == JobStatus::AwaitingApproval
        })
        .await;
    assert!(job.cost_estimate.is_some());

    let approved = harness.submit().approve_job(&job_id).await.unwrap();
    assert_eq!(approved.status, JobStatus::Approved);

    // Approve is not idempotent: a second approval conflicts.
    let err = harness.submit().approve_job(&job_id).await.unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));

    let job = harness.wait_terminal(&job_id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);

    let err = harness.submit().approve_job(&job_id).await.unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));

    // Cancel on a terminal job changes nothing.
    let cancel = harness.submit().cancel_job(&job_id).await.unwrap();
    assert!(!cancel.cancelled);
    assert_eq!(cancel.at_status, JobStatus::Completed);

    harness.stop().await;
}

#[tokio::test]
async fn concurrency_bound_is_respected() {
    let extractor = ScriptedExtractor::new().with_delay(Duration::from_millis(100));
    let mut harness = Harness::new(extractor, |config| {
        config.max_concurrent_jobs = 1;
    })
    .await;
    harness.start();

    let mut ids = Vec::new();
    for i in 0..3 {
        let outcome = harness
            .submit()
            .submit_ingestion(
                format!("{} Topic Phrase{} end", filler(50 + i), i),
                "notes",
                auto_options(),
                "tester",
            )
            .await
            .unwrap();
        ids.push(outcome.job().id.clone());
    }

    let deadline = tokio::time::Instant::now() + LONG;
    loop {
        let stats = harness.store.stats().await.unwrap();
        assert!(stats.processing <= 1, "processing={} exceeds bound", stats.processing);
        if stats.completed == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    harness.stop().await;
}

#[tokio::test]
async fn strict_mode_fails_job_on_permanent_chunk_failure() {
    let extractor = ScriptedExtractor::new().with_failures(FailureScript::AlwaysPermanent);
    let mut harness = Harness::new(extractor, |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(filler(100), "notes", auto_options(), "tester")
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExtractionFailed);
    assert!(error.message.contains("chunk 0"));

    harness.stop().await;
}

#[tokio::test]
async fn partial_mode_completes_with_failed_chunks_noted() {
    let extractor = ScriptedExtractor::new().with_failures(FailureScript::AlwaysPermanent);
    let mut harness = Harness::new(extractor, |_| {}).await;
    harness.start();

    let mut options = auto_options();
    options.partial_failures = true;
    let outcome = harness
        .submit()
        .submit_ingestion(filler(100), "notes", options, "tester")
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.chunks_processed, 0);
    assert!(result.note.unwrap().contains("skipped"));

    harness.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let extractor = ScriptedExtractor::new().with_failures(FailureScript::TransientTimes(1));
    let mut harness = Harness::new(extractor, |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(
            format!("{} Stable Phrase {}", filler(20), filler(20)),
            "notes",
            auto_options(),
            "tester",
        )
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(harness.extractor.call_count() >= 2);

    harness.stop().await;
}

#[tokio::test]
async fn invalid_output_retried_once_with_strict_prompt() {
    let extractor = ScriptedExtractor::new().with_failures(FailureScript::InvalidOnce);
    let mut harness = Harness::new(extractor, |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(filler(100), "notes", auto_options(), "tester")
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(harness.extractor.call_count(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn unapproved_jobs_expire_after_ttl() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |config| {
        config.approval_ttl = Duration::from_millis(100);
    })
    .await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion(filler(100), "notes", IngestOptions::default(), "tester")
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Expired);

    harness.stop().await;
}

#[tokio::test]
async fn empty_document_completes_trivially() {
    let mut harness = Harness::new(ScriptedExtractor::new(), |_| {}).await;
    harness.start();

    let outcome = harness
        .submit()
        .submit_ingestion("   \n  ".to_string(), "notes", auto_options(), "tester")
        .await
        .unwrap();
    let job = harness.wait_terminal(&outcome.job().id, LONG).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result.chunks_total, 0);
    assert_eq!(result.chunks_processed, 0);
    assert_eq!(harness.graph.source_ids().len(), 0);
    assert_eq!(harness.extractor.call_count(), 0);

    harness.stop().await;
}
