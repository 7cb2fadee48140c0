//! LLM and embedding provider plane.
//!
//! The worker depends only on the [`Extractor`] and [`Embedder`] traits;
//! the OpenAI-compatible HTTP implementations live behind them. Retry,
//! backoff, and per-provider throttling are provider concerns and live
//! here too.

pub mod embedder;
pub mod error;
pub mod extractor;
pub mod openai;
pub mod prompt;
pub mod rate_limit;
pub mod retry;

pub use embedder::{Embedder, EmbeddingConfig};
pub use error::ProviderError;
pub use extractor::{ExtractRequest, ExtractionOutcome, Extractor, KnownConcept, TokenUsage};
pub use openai::{OpenAiConfig, OpenAiEmbedder, OpenAiExtractor};
pub use rate_limit::{ProviderThrottle, TokenBucket};
pub use retry::{with_retries, Attempt, RetryPolicy};
