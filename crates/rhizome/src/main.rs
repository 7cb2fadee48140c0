//! Rhizome CLI.
//!
//! Exit codes: 0 success, 2 validation error, 3 not found, 4 conflict,
//! 5 server/store unavailable.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use rhizome_logging::{init_logging, LogConfig};

#[derive(Parser)]
#[command(name = "rhizome", version, about = "Document-to-knowledge-graph ingestion")]
struct Cli {
    /// Verbose console logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the Rhizome home directory.
    #[arg(long, global = true, env = "RHIZOME_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a document for ingestion.
    Submit {
        /// File to ingest; use '-' for stdin.
        file: String,
        /// Ontology namespace the concepts attach to.
        #[arg(short, long)]
        ontology: String,
        /// Target chunk size in words.
        #[arg(long, default_value_t = 1000)]
        target_words: u32,
        /// Overlap between adjacent chunks in words.
        #[arg(long, default_value_t = 200)]
        overlap_words: u32,
        /// Re-ingest even if this content was ingested before.
        #[arg(long)]
        force: bool,
        /// Skip the approval hold.
        #[arg(long)]
        auto_approve: bool,
        /// Skip failed chunks instead of failing the job.
        #[arg(long)]
        partial: bool,
        /// Extraction profile (fast | balanced | thorough).
        #[arg(long)]
        profile: Option<String>,
        /// Display name recorded on sources (defaults to the file name).
        #[arg(long)]
        filename: Option<String>,
    },
    /// Show one job.
    Status {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List jobs.
    List {
        /// Filter by status.
        #[arg(long)]
        status: Option<String>,
        /// Filter by owner.
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        json: bool,
    },
    /// Approve a job awaiting approval.
    Approve { job_id: String },
    /// Cancel a job.
    Cancel { job_id: String },
    /// Queue statistics.
    Stats,
    /// Delete terminal jobs older than the retention window.
    Prune {
        /// Override the retention window, in days.
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Run the scheduler and workers.
    Serve {
        /// Maximum jobs in processing at once.
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "rhizome",
        verbose: cli.verbose,
    }) {
        eprintln!("warning: logging setup failed: {e:#}");
    }

    let home = cli
        .home
        .clone()
        .unwrap_or_else(rhizome_logging::rhizome_home);

    match commands::run(cli.command, home).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e.message);
            ExitCode::from(e.code)
        }
    }
}
