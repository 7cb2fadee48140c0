//! Pre-approval cost estimation (the dry-run phase).
//!
//! No provider is called: the estimate multiplies chunk counts by expected
//! per-chunk token volumes and the published model prices, erring high for
//! unknown models.

use anyhow::{Context, Result};
use rhizome_protocol::profiles::{
    pricing_for, EST_OUTPUT_TOKENS_PER_CHUNK, PROMPT_OVERHEAD_TOKENS, TOKENS_PER_WORD,
};
use rhizome_protocol::{CostEstimate, ExtractionProfile, Job, JobInput, SystemConfig};

use crate::chunker::{chunk_text, Chunk};

pub fn estimate_cost(
    chunks: &[Chunk],
    profile: &ExtractionProfile,
    embedding_model: &str,
) -> CostEstimate {
    let content_tokens: u64 = chunks
        .iter()
        .map(|c| (c.word_count as f64 * TOKENS_PER_WORD).ceil() as u64)
        .sum();
    let tokens_in = content_tokens + chunks.len() as u64 * PROMPT_OVERHEAD_TOKENS;
    let tokens_out = chunks.len() as u64 * EST_OUTPUT_TOKENS_PER_CHUNK;

    let extraction_prices = pricing_for(&profile.model);
    let usd_extraction = (tokens_in as f64 / 1000.0) * extraction_prices.usd_per_1k_input
        + (tokens_out as f64 / 1000.0) * extraction_prices.usd_per_1k_output;

    // Embedding spend covers the labels and search terms the extractor is
    // expected to produce, approximated as a slice of the content volume.
    let embedding_tokens = (content_tokens as f64 * 0.1).ceil() as u64;
    let embedding_prices = pricing_for(embedding_model);
    let usd_embedding = (embedding_tokens as f64 / 1000.0) * embedding_prices.usd_per_1k_input;

    CostEstimate {
        tokens_in,
        tokens_out,
        usd_extraction,
        usd_embedding,
        usd_total: usd_extraction + usd_embedding,
        model_ids: vec![profile.model.clone(), embedding_model.to_string()],
    }
}

/// Dry-run estimation for one stored job: load its input, chunk it with the
/// job's own options, and price the work.
pub async fn estimate_job(
    job: &Job,
    config: &SystemConfig,
    embedding_model: &str,
) -> Result<CostEstimate> {
    let text = match &job.input {
        JobInput::Inline { text } => text.clone(),
        JobInput::Blob { path, .. } => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read staged input {path:?}"))?,
    };
    let chunks = chunk_text(&text, job.options.target_words, job.options.overlap_words);

    let selector = job
        .options
        .profile
        .as_deref()
        .unwrap_or(&config.default_profile);
    let profile = ExtractionProfile::lookup(selector)
        .with_context(|| format!("unknown extraction profile {selector:?}"))?;

    Ok(estimate_cost(&chunks, &profile, embedding_model))
}
