//! Command implementations and exit-code mapping.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use rhizome_graph::{ConceptResolver, MemoryGraph, ResolverConfig, UpsertEngine};
use rhizome_ids::{JobId, WorkerId};
use rhizome_protocol::{IngestOptions, Job, JobStatus, SystemConfig};
use rhizome_providers::{OpenAiConfig, OpenAiEmbedder, OpenAiExtractor, ProviderThrottle};
use rhizome_scheduler::{Scheduler, SubmitError, SubmitOutcome, SubmitService};
use rhizome_store::{JobFilter, JobStore};
use rhizome_worker::WorkerContext;

use crate::Command;

pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SubmitError> for CliError {
    fn from(error: SubmitError) -> Self {
        let code = match &error {
            SubmitError::Validation(_) => 2,
            SubmitError::NotFound(_) => 3,
            SubmitError::Conflict(_) => 4,
            SubmitError::Store(_) | SubmitError::Internal(_) => 5,
        };
        Self::new(code, error.to_string())
    }
}

impl From<rhizome_store::StoreError> for CliError {
    fn from(error: rhizome_store::StoreError) -> Self {
        CliError::from(SubmitError::from(error))
    }
}

async fn open_store(config: &SystemConfig) -> Result<Arc<JobStore>, CliError> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new(5, format!("cannot create {}: {e}", parent.display())))?;
    }
    let store = JobStore::open(&config.db_path)
        .await
        .map_err(|e| CliError::new(5, format!("cannot open job store: {e}")))?;
    Ok(Arc::new(store))
}

fn parse_job_id(raw: &str) -> Result<JobId, CliError> {
    JobId::parse(raw).map_err(|e| CliError::new(2, e.to_string()))
}

pub async fn run(command: Command, home: PathBuf) -> Result<(), CliError> {
    let config = Arc::new(SystemConfig::with_home(home.clone()));

    match command {
        Command::Submit {
            file,
            ontology,
            target_words,
            overlap_words,
            force,
            auto_approve,
            partial,
            profile,
            filename,
        } => {
            let (content, default_name) = read_content(&file)?;
            let options = IngestOptions {
                target_words,
                overlap_words,
                force,
                auto_approve,
                partial_failures: partial,
                profile,
                filename: filename.or(default_name),
            };
            let store = open_store(&config).await?;
            let service = SubmitService::new(store, Arc::clone(&config));
            let owner = whoami();
            let outcome = service
                .submit_ingestion(content, &ontology, options, &owner)
                .await?;
            match outcome {
                SubmitOutcome::Created(job) => {
                    println!("submitted {} ({})", job.id, job.status);
                }
                SubmitOutcome::Duplicate(job) => {
                    println!(
                        "duplicate of {} ({}); use --force to re-ingest",
                        job.id, job.status
                    );
                }
            }
            Ok(())
        }

        Command::Status { job_id, json } => {
            let store = open_store(&config).await?;
            let job = store.get(&parse_job_id(&job_id)?).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&job)
                        .map_err(|e| CliError::new(5, e.to_string()))?
                );
            } else {
                print_job(&job);
            }
            Ok(())
        }

        Command::List {
            status,
            owner,
            limit,
            offset,
            json,
        } => {
            let status = match status.as_deref() {
                None => None,
                Some(raw) => Some(
                    JobStatus::parse(raw)
                        .ok_or_else(|| CliError::new(2, format!("unknown status {raw:?}")))?,
                ),
            };
            let store = open_store(&config).await?;
            let jobs = store
                .list(&JobFilter {
                    status,
                    owner,
                    created_after: None,
                    created_before: None,
                    limit,
                    offset,
                })
                .await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&jobs)
                        .map_err(|e| CliError::new(5, e.to_string()))?
                );
            } else {
                for job in &jobs {
                    println!(
                        "{}  {:18}  {}  {}",
                        job.id,
                        job.status.as_str(),
                        job.ontology,
                        job.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                if jobs.is_empty() {
                    println!("no jobs");
                }
            }
            Ok(())
        }

        Command::Approve { job_id } => {
            let store = open_store(&config).await?;
            let service = SubmitService::new(store, Arc::clone(&config));
            let job = service.approve_job(&parse_job_id(&job_id)?).await?;
            println!("approved {} ({})", job.id, job.status);
            Ok(())
        }

        Command::Cancel { job_id } => {
            let store = open_store(&config).await?;
            let service = SubmitService::new(store, Arc::clone(&config));
            let id = parse_job_id(&job_id)?;
            let outcome = service.cancel_job(&id).await?;
            if outcome.cancelled {
                println!("cancel requested at status {}", outcome.at_status);
                Ok(())
            } else {
                Err(CliError::new(
                    4,
                    format!("job is already terminal ({})", outcome.at_status),
                ))
            }
        }

        Command::Stats => {
            let store = open_store(&config).await?;
            let stats = store.stats().await?;
            println!("queued             {}", stats.queued);
            println!("awaiting_approval  {}", stats.awaiting_approval);
            println!("approved           {}", stats.approved);
            println!("processing         {}", stats.processing);
            println!("completed          {}", stats.completed);
            println!("failed             {}", stats.failed);
            println!("cancelled          {}", stats.cancelled);
            println!("expired            {}", stats.expired);
            Ok(())
        }

        Command::Prune { older_than_days } => {
            let store = open_store(&config).await?;
            let window = match older_than_days {
                Some(days) => chrono::Duration::days(days),
                None => chrono::Duration::from_std(config.retention_window)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
            };
            let pruned = store.prune_terminal(chrono::Utc::now() - window).await?;
            println!("pruned {pruned} terminal job(s)");
            Ok(())
        }

        Command::Serve { max_concurrent } => {
            let mut config = SystemConfig::with_home(home);
            if let Some(limit) = max_concurrent {
                config.max_concurrent_jobs = limit.max(1);
            }
            serve(Arc::new(config)).await
        }
    }
}

async fn serve(config: Arc<SystemConfig>) -> Result<(), CliError> {
    let store = open_store(&config).await?;

    let provider_config = OpenAiConfig::from_env().ok_or_else(|| {
        CliError::new(
            5,
            "OPENAI_API_KEY is not set; the extractor and embedder need provider credentials",
        )
    })?;
    let throttle = ProviderThrottle::new();
    let chat_bucket = throttle.bucket_for("openai", "chat", provider_config.requests_per_sec);
    let embed_bucket = throttle.bucket_for(
        "openai",
        &provider_config.embedding_model,
        provider_config.requests_per_sec,
    );
    let extractor = OpenAiExtractor::new(provider_config.clone(), chat_bucket)
        .map_err(|e| CliError::new(5, e.to_string()))?;
    let embedder = OpenAiEmbedder::new(provider_config, embed_bucket)
        .map_err(|e| CliError::new(5, e.to_string()))?;

    // The embedded graph backend does not survive restarts; production
    // deployments point the engine at an external store instead.
    let graph = MemoryGraph::new();
    tracing::warn!("Using the embedded in-memory graph backend (non-durable)");
    let backend = Arc::new(graph);
    let resolver = ConceptResolver::new(
        backend.clone() as Arc<dyn rhizome_graph::GraphBackend>,
        ResolverConfig {
            match_threshold: config.match_threshold,
            ontology_scoped: config.ontology_scoped_match,
            fallback: config.search_term_fallback,
            ..Default::default()
        },
    );

    let ctx = WorkerContext {
        store,
        engine: Arc::new(UpsertEngine::new(
            backend as Arc<dyn rhizome_graph::GraphBackend>,
        )),
        resolver: Arc::new(resolver),
        extractor: Arc::new(extractor),
        embedder: Arc::new(embedder),
        config,
        worker_id: WorkerId::new(),
    };

    let scheduler = Scheduler::new(ctx);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler
        .run_with_shutdown(shutdown_rx)
        .await
        .map_err(|e| CliError::new(5, format!("scheduler stopped: {e:#}")))
}

fn read_content(file: &str) -> Result<(String, Option<String>), CliError> {
    if file == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|e| CliError::new(2, format!("failed to read stdin: {e}")))?;
        return Ok((content, None));
    }
    let path = PathBuf::from(file);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| CliError::new(2, format!("failed to read {}: {e}", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string());
    Ok((content, name))
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn print_job(job: &Job) {
    println!("job        {}", job.id);
    let stalled = job.status == JobStatus::Processing
        && job.last_progress_at.map_or(false, |at| {
            (chrono::Utc::now() - at).to_std().map_or(false, |age| {
                age > rhizome_protocol::config::defaults::STALL_THRESHOLD
            })
        });
    if stalled {
        println!("status     {} (stalled?)", job.status);
    } else {
        println!("status     {}", job.status);
    }
    println!("ontology   {}", job.ontology);
    println!("owner      {}", job.owner);
    println!("created    {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(estimate) = &job.cost_estimate {
        println!(
            "estimate   ${:.4} ({} in / {} out tokens, models: {})",
            estimate.usd_total,
            estimate.tokens_in,
            estimate.tokens_out,
            estimate.model_ids.join(", ")
        );
    }
    if let Some(progress) = &job.progress {
        println!(
            "progress   {}% ({}/{} chunks, stage {})",
            progress.percent, progress.chunks_processed, progress.chunks_total, progress.stage
        );
        let c = &progress.counters;
        println!(
            "graph      +{} concepts, {} linked, +{} instances, +{} relationships, +{} sources",
            c.concepts_created,
            c.concepts_linked,
            c.instances_created,
            c.relationships_created,
            c.sources_created
        );
    }
    if let Some(result) = &job.result {
        println!(
            "result     {}/{} chunks, {} failed, ${:.4}",
            result.chunks_processed, result.chunks_total, result.chunks_failed, result.usd_total
        );
        if let Some(note) = &result.note {
            println!("note       {note}");
        }
    }
    if let Some(error) = &job.error {
        println!("error      [{}] {}", error.kind, error.message);
    }
    if job.cancellation_requested && !job.status.is_terminal() {
        println!("cancel     requested");
    }
}
