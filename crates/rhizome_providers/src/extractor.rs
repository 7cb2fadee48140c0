//! Extractor interface.

use async_trait::async_trait;
use rhizome_protocol::{ExtractionResult, ExtractionProfile};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// One already-known concept handed to the extractor as context so it can
/// reuse stable ids instead of inventing synonyms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownConcept {
    pub id: String,
    pub label: String,
    pub search_terms: Vec<String>,
}

/// Billed token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }
}

/// One extraction call.
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub chunk_text: &'a str,
    pub context: &'a [KnownConcept],
    pub profile: &'a ExtractionProfile,
    /// Set on the retry after an `InvalidOutput` failure; the prompt gains
    /// a reminder restating the schema.
    pub strict_reminder: bool,
}

/// The parsed payload plus what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    pub result: ExtractionResult,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, request: ExtractRequest<'_>) -> Result<ExtractionOutcome, ProviderError>;

    /// Provider identity for throttling and logs, e.g. `("openai", model)`.
    fn provider_id(&self) -> (String, String);
}
