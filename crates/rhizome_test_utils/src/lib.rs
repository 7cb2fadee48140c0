//! Deterministic provider fakes for integration tests.
//!
//! The scripted extractor derives concepts from capitalized phrases in the
//! chunk so different documents mentioning the same phrase produce the same
//! proposal, which is exactly what the resolver tests need. The stub
//! embedder hashes normalized labels into stable unit vectors, so equal
//! labels embed identically and different labels land (nearly) orthogonal.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rhizome_protocol::{
    ExtractedConcept, ExtractedInstance, ExtractedRelationship, ExtractionResult,
};
use rhizome_providers::{
    Embedder, EmbeddingConfig, ExtractRequest, ExtractionOutcome, Extractor, ProviderError,
    TokenUsage,
};

// ----------------------------------------------------------------------
// Scripted extractor
// ----------------------------------------------------------------------

/// Failure behavior injected before successful extraction.
#[derive(Debug, Clone)]
pub enum FailureScript {
    /// Fail the first `n` calls with a transient error.
    TransientTimes(u32),
    /// Fail the first call with schema-invalid output.
    InvalidOnce,
    /// Every call fails permanently.
    AlwaysPermanent,
}

/// Extractor that derives one concept per capitalized multi-word phrase,
/// one instance quoting the phrase, and a SUPPORTS relationship between the
/// first two concepts of a chunk.
pub struct ScriptedExtractor {
    calls: AtomicU32,
    delay: Option<Duration>,
    script: Mutex<Option<FailureScript>>,
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay: None,
            script: Mutex::new(None),
        }
    }

    /// Sleep this long per call, to keep jobs in flight while a test
    /// cancels or kills them.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failures(self, script: FailureScript) -> Self {
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = Some(script);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<ProviderError> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        match script.take() {
            None => None,
            Some(FailureScript::TransientTimes(n)) => {
                if n > 1 {
                    *script = Some(FailureScript::TransientTimes(n - 1));
                }
                Some(ProviderError::Transient("scripted transient failure".into()))
            }
            Some(FailureScript::InvalidOnce) => {
                Some(ProviderError::InvalidOutput("scripted invalid output".into()))
            }
            Some(FailureScript::AlwaysPermanent) => {
                *script = Some(FailureScript::AlwaysPermanent);
                Some(ProviderError::Permanent("scripted permanent failure".into()))
            }
        }
    }
}

/// Capitalized runs of 2+ words ("Linear Scanning System") become concept
/// proposals; order of first appearance, deduplicated.
pub fn phrases_in(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut phrases = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for word in words.iter().chain(std::iter::once(&"")) {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        let capitalized = cleaned.chars().next().map_or(false, |c| c.is_uppercase());
        if capitalized {
            current.push(cleaned);
        } else {
            if current.len() >= 2 {
                let phrase = current.join(" ");
                if !phrases.contains(&phrase) {
                    phrases.push(phrase);
                }
            }
            current.clear();
        }
    }
    phrases
}

fn kebab(label: &str) -> String {
    label
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        request: ExtractRequest<'_>,
    ) -> Result<ExtractionOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.next_failure() {
            return Err(failure);
        }

        let phrases = phrases_in(request.chunk_text);
        let concepts: Vec<ExtractedConcept> = phrases
            .iter()
            .map(|label| ExtractedConcept {
                concept_id: kebab(label),
                label: label.clone(),
                confidence: 0.9,
                search_terms: label.split_whitespace().map(|w| w.to_lowercase()).collect(),
            })
            .collect();

        // Quote the first occurrence of each phrase verbatim.
        let instances: Vec<ExtractedInstance> = phrases
            .iter()
            .filter_map(|label| {
                let needle = label.split_whitespace().next()?;
                request.chunk_text.find(needle).map(|at| {
                    let end = (at + label.len()).min(request.chunk_text.len());
                    ExtractedInstance {
                        concept_id: kebab(label),
                        quote: request.chunk_text[at..end].to_string(),
                    }
                })
            })
            .collect();

        let relationships = if concepts.len() >= 2 {
            vec![ExtractedRelationship {
                from_concept_id: concepts[0].concept_id.clone(),
                to_concept_id: concepts[1].concept_id.clone(),
                rel_type: "SUPPORTS".to_string(),
                confidence: 0.8,
            }]
        } else {
            Vec::new()
        };

        let words = request.chunk_text.split_whitespace().count() as u64;
        Ok(ExtractionOutcome {
            result: ExtractionResult {
                concepts,
                instances,
                relationships,
            },
            usage: TokenUsage {
                input: words + 100,
                output: 50,
            },
        })
    }

    fn provider_id(&self) -> (String, String) {
        ("scripted".to_string(), "test".to_string())
    }
}

// ----------------------------------------------------------------------
// Stub embedder
// ----------------------------------------------------------------------

/// Embeds normalized text into a stable unit vector: equal labels map to
/// equal vectors, different labels to (nearly) orthogonal ones. Explicit
/// overrides let a test force two labels close together.
pub struct StubEmbedder {
    dimension: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(4),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a specific vector for a label (compared case-insensitively).
    pub fn set_vector(&self, label: &str, vector: Vec<f32>) {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(label), vector);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let key = normalize(text);
        if let Some(vector) = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return vector.clone();
        }
        // FNV-style hash spread over a one-hot-ish basis vector.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in key.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut vector = vec![0.0f32; self.dimension];
        vector[(hash % self.dimension as u64) as usize] = 1.0;
        vector[(hash >> 32) as usize % self.dimension] += 0.1;
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        vector.iter_mut().for_each(|x| *x /= norm);
        vector
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn active_config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "stub".to_string(),
            model: "hash".to_string(),
            dimension: self.dimension,
            normalize: true,
        }
    }
}
