//! Provider failure kinds.

use rhizome_protocol::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout, 5xx, connection reset. Retried with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// 429 or provider-signalled throttling. Retried with the advised
    /// delay when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Schema-invalid output. Retried once with the strict-reminder prompt.
    #[error("invalid provider output: {0}")]
    InvalidOutput(String),

    /// Auth failures, bad requests, exhausted retries. Not retried.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::InvalidOutput(_) => ErrorKind::InvalidOutput,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }
}
