//! Jobs table schema and indexes.

use sqlx::{Pool, Sqlite};

use crate::error::Result;

pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rz_jobs (
    id                      TEXT PRIMARY KEY,
    kind                    TEXT NOT NULL,
    content_fingerprint     TEXT NOT NULL,
    ontology                TEXT NOT NULL,
    input_ref               TEXT NOT NULL,
    options_json            TEXT NOT NULL,
    status                  TEXT NOT NULL,
    progress_json           TEXT,
    cost_estimate_json      TEXT,
    result_json             TEXT,
    error_kind              TEXT,
    error_message           TEXT,
    cancellation_requested  INTEGER NOT NULL DEFAULT 0,
    owner_principal         TEXT NOT NULL,
    worker_id               TEXT,
    lease_expires_at        TEXT,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL,
    approved_at             TEXT,
    started_at              TEXT,
    completed_at            TEXT,
    last_progress_at        TEXT
)
"#;

/// FIFO claim scans (status, approved_at); duplicate lookup is newest-first
/// by fingerprint; per-user listing newest-first; the reaper scans
/// (status, lease_expires_at).
const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_rz_jobs_status_approved ON rz_jobs (status, approved_at)",
    "CREATE INDEX IF NOT EXISTS idx_rz_jobs_fingerprint ON rz_jobs (content_fingerprint, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_rz_jobs_owner ON rz_jobs (owner_principal, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_rz_jobs_lease ON rz_jobs (status, lease_expires_at)",
];

pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(CREATE_JOBS_TABLE).execute(pool).await?;
    for stmt in CREATE_INDEXES {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
