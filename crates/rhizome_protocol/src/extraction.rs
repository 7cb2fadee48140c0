//! Extraction wire schema.
//!
//! Extractor output is a UTF-8 JSON object with exactly the top-level keys
//! `concepts`, `instances`, `relationships`. Unknown keys are ignored;
//! missing keys are errors. Concept ids are kebab-case ASCII; confidences
//! are in [0, 1].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub concepts: Vec<ExtractedConcept>,
    pub instances: Vec<ExtractedInstance>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self {
            concepts: Vec::new(),
            instances: Vec::new(),
            relationships: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedConcept {
    pub concept_id: String,
    pub label: String,
    pub confidence: f64,
    pub search_terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInstance {
    pub concept_id: String,
    pub quote: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from_concept_id: String,
    pub to_concept_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ExtractionParseError {
    #[error("extraction output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("concept id {0:?} is not kebab-case ASCII")]
    BadConceptId(String),
    #[error("confidence {value} for {subject} outside [0, 1]")]
    BadConfidence { subject: String, value: f64 },
    #[error("relationship type {0:?} is empty")]
    EmptyRelationType(String),
}

/// True for non-empty lowercase ASCII alphanumeric ids with single-dash
/// separators: `linear-scanning-system`, not `Linear--scan-`.
pub fn is_kebab_case(id: &str) -> bool {
    if id.is_empty() || id.starts_with('-') || id.ends_with('-') || id.contains("--") {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Parse and schema-check one extraction payload. Structural checks only;
/// cross-referencing against the chunk (quote substrings, id closure) is the
/// worker's job because it needs the chunk text.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, ExtractionParseError> {
    let result: ExtractionResult = serde_json::from_str(raw)?;

    for concept in &result.concepts {
        if !is_kebab_case(&concept.concept_id) {
            return Err(ExtractionParseError::BadConceptId(
                concept.concept_id.clone(),
            ));
        }
        if !(0.0..=1.0).contains(&concept.confidence) {
            return Err(ExtractionParseError::BadConfidence {
                subject: format!("concept {}", concept.concept_id),
                value: concept.confidence,
            });
        }
    }
    for rel in &result.relationships {
        if rel.rel_type.trim().is_empty() {
            return Err(ExtractionParseError::EmptyRelationType(rel.rel_type.clone()));
        }
        if !(0.0..=1.0).contains(&rel.confidence) {
            return Err(ExtractionParseError::BadConfidence {
                subject: format!(
                    "relationship {} -> {}",
                    rel.from_concept_id, rel.to_concept_id
                ),
                value: rel.confidence,
            });
        }
    }

    Ok(result)
}
