//! Extraction profiles and model pricing.
//!
//! A profile names the model and sampling settings the extractor runs with.
//! Pricing feeds the pre-approval cost estimate; rates are per 1K tokens.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROFILE: &str = "balanced";

/// Profile descriptor handed to the extractor per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub id: String,
    pub model: String,
    pub thinking: bool,
    pub temperature: f32,
    pub top_p: f32,
}

impl ExtractionProfile {
    /// Resolve a profile selector. Unknown ids fall back to `None` so the
    /// caller can surface a validation error.
    pub fn lookup(id: &str) -> Option<Self> {
        BUILTIN_PROFILES.iter().find(|p| p.0 == id).map(|p| Self {
            id: p.0.to_string(),
            model: p.1.to_string(),
            thinking: p.2,
            temperature: p.3,
            top_p: p.4,
        })
    }

    pub fn default_profile() -> Self {
        Self::lookup(DEFAULT_PROFILE).unwrap_or(Self {
            id: DEFAULT_PROFILE.to_string(),
            model: "gpt-4o-mini".to_string(),
            thinking: false,
            temperature: 0.2,
            top_p: 1.0,
        })
    }
}

// (id, model, thinking, temperature, top_p)
const BUILTIN_PROFILES: &[(&str, &str, bool, f32, f32)] = &[
    ("fast", "gpt-4o-mini", false, 0.0, 1.0),
    ("balanced", "gpt-4o-mini", false, 0.2, 1.0),
    ("thorough", "gpt-4o", true, 0.2, 0.95),
];

/// USD per 1K tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub usd_per_1k_input: f64,
    pub usd_per_1k_output: f64,
}

/// Published prices for the models the built-in profiles use. Unknown
/// models get the most expensive known rate so estimates err high.
pub fn pricing_for(model: &str) -> ModelPricing {
    match model {
        "gpt-4o-mini" => ModelPricing {
            usd_per_1k_input: 0.000_15,
            usd_per_1k_output: 0.000_60,
        },
        "gpt-4o" => ModelPricing {
            usd_per_1k_input: 0.002_50,
            usd_per_1k_output: 0.010_00,
        },
        "text-embedding-3-small" => ModelPricing {
            usd_per_1k_input: 0.000_02,
            usd_per_1k_output: 0.0,
        },
        "text-embedding-3-large" => ModelPricing {
            usd_per_1k_input: 0.000_13,
            usd_per_1k_output: 0.0,
        },
        _ => ModelPricing {
            usd_per_1k_input: 0.002_50,
            usd_per_1k_output: 0.010_00,
        },
    }
}

/// Expected extractor output size per chunk, in tokens. Observed payloads
/// run 300-700 tokens for 1000-word chunks.
pub const EST_OUTPUT_TOKENS_PER_CHUNK: u64 = 500;

/// Rough tokens-per-word ratio for English prose.
pub const TOKENS_PER_WORD: f64 = 1.3;

/// Prompt scaffolding (instructions + known-concept context) per call.
pub const PROMPT_OVERHEAD_TOKENS: u64 = 900;
