//! Graph node and edge shapes.

use rhizome_ids::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GraphError;

/// A specific chunk of a specific document. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    /// Derived as `<document>#<chunk_index>@<job_key>`. The job key keeps a
    /// forced re-ingest's sources distinct from the original run's while a
    /// re-run of the same job still finds its own committed chunks.
    pub id: String,
    pub document: String,
    pub chunk_index: u32,
    pub full_text: String,
    pub word_count: u32,
    /// Denormalized for query speed.
    pub ontology: String,
}

impl SourceNode {
    pub fn source_id(document: &str, chunk_index: u32, job_key: &str) -> String {
        format!("{document}#{chunk_index}@{job_key}")
    }
}

/// Directed concept-to-concept edge type. Uppercase ASCII with underscores;
/// the vocabulary is dynamic but well-known terms get constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationType(String);

impl RelationType {
    pub const IMPLIES: &'static str = "IMPLIES";
    pub const SUPPORTS: &'static str = "SUPPORTS";
    pub const CONTRADICTS: &'static str = "CONTRADICTS";
    pub const PART_OF: &'static str = "PART_OF";
    pub const REQUIRES: &'static str = "REQUIRES";

    /// Normalizes to uppercase; rejects anything but `[A-Z0-9_]+`.
    pub fn parse(value: &str) -> Result<Self, GraphError> {
        let normalized = value.trim().to_ascii_uppercase();
        if normalized.is_empty()
            || !normalized
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(GraphError::BadRelationType(value.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A directed edge between two resolved concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptRelationship {
    pub from_concept: String,
    pub to_concept: String,
    pub rel_type: RelationType,
    pub confidence: f64,
}

/// A verbatim quote linking a concept to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstance {
    pub id: InstanceId,
    pub concept_id: String,
    pub quote: String,
}
