//! Semantic validation of extractor output against the chunk.
//!
//! Structural checks (kebab ids, confidence ranges, mandatory keys) already
//! happened when the payload was parsed; this pass needs the chunk text.
//! Failures here are not retryable and are fatal to the chunk.

use rhizome_protocol::ExtractionResult;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("instance references unknown concept id {0:?}")]
    UnknownInstanceConcept(String),

    #[error("relationship references unknown concept id {0:?}")]
    UnknownRelationshipConcept(String),

    #[error("quote is not a substring of the chunk: {0:?}")]
    QuoteNotInChunk(String),

    #[error("relationship endpoints are the same concept {0:?}")]
    SelfRelationship(String),
}

pub fn validate_extraction(
    result: &ExtractionResult,
    chunk_text: &str,
) -> Result<(), ValidationFailure> {
    let ids: HashSet<&str> = result
        .concepts
        .iter()
        .map(|c| c.concept_id.as_str())
        .collect();

    for instance in &result.instances {
        if !ids.contains(instance.concept_id.as_str()) {
            return Err(ValidationFailure::UnknownInstanceConcept(
                instance.concept_id.clone(),
            ));
        }
        if !chunk_text.contains(&instance.quote) {
            return Err(ValidationFailure::QuoteNotInChunk(truncated(&instance.quote)));
        }
    }

    for rel in &result.relationships {
        if !ids.contains(rel.from_concept_id.as_str()) {
            return Err(ValidationFailure::UnknownRelationshipConcept(
                rel.from_concept_id.clone(),
            ));
        }
        if !ids.contains(rel.to_concept_id.as_str()) {
            return Err(ValidationFailure::UnknownRelationshipConcept(
                rel.to_concept_id.clone(),
            ));
        }
        if rel.from_concept_id == rel.to_concept_id {
            return Err(ValidationFailure::SelfRelationship(rel.from_concept_id.clone()));
        }
    }

    Ok(())
}

fn truncated(quote: &str) -> String {
    const MAX: usize = 80;
    if quote.len() <= MAX {
        return quote.to_string();
    }
    let mut end = MAX;
    while end > 0 && !quote.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &quote[..end])
}
