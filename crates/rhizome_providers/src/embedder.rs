//! Embedder interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// The active embedding configuration. Changing it requires regenerating
/// stored embeddings; the resolver refuses cross-dimension matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub normalize: bool,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector of `active_config().dimension`
    /// per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn active_config(&self) -> EmbeddingConfig;
}
