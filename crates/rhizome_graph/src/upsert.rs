//! Idempotent chunk writes.
//!
//! Everything a chunk produces lands in one transactional unit: the source
//! node, APPEARS_IN provenance for each resolved concept, evidence
//! instances, and relationship merges. A failed batch leaves no trace, so
//! an interrupted chunk is simply re-run.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use rhizome_protocol::GraphCounters;

use crate::backend::GraphBackend;
use crate::cypher;
use crate::error::GraphError;
use crate::types::{ConceptRelationship, NewInstance, SourceNode};

/// One resolved concept to associate with the chunk's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptLink {
    pub concept_id: String,
    /// Whether resolution allocated this node (for the counters).
    pub created: bool,
}

/// The full write set for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkBatch {
    pub source: SourceNode,
    pub concept_links: Vec<ConceptLink>,
    pub instances: Vec<NewInstance>,
    pub relationships: Vec<ConceptRelationship>,
}

pub type ChunkWriteStats = GraphCounters;

pub struct UpsertEngine {
    backend: Arc<dyn GraphBackend>,
}

impl UpsertEngine {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self { backend }
    }

    /// True when this chunk already committed in a previous run.
    pub async fn source_exists(&self, source_id: &str) -> Result<bool, GraphError> {
        let rows = self
            .backend
            .run(cypher::SOURCE_EXISTS, json!({ "id": source_id }))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Write one chunk batch transactionally and report what changed.
    pub async fn apply_chunk(&self, batch: &ChunkBatch) -> Result<ChunkWriteStats, GraphError> {
        let source_is_new = !self.source_exists(&batch.source.id).await?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.backend.begin().await?;

        tx.run(
            cypher::MERGE_SOURCE,
            json!({
                "id": batch.source.id,
                "document": batch.source.document,
                "chunk_index": batch.source.chunk_index,
                "full_text": batch.source.full_text,
                "word_count": batch.source.word_count,
                "ontology": batch.source.ontology,
            }),
        )
        .await?;

        // Provenance once per distinct concept, even when several proposals
        // resolved to the same node.
        let mut linked: HashSet<&str> = HashSet::new();
        for link in &batch.concept_links {
            if !linked.insert(link.concept_id.as_str()) {
                continue;
            }
            tx.run(
                cypher::MERGE_APPEARS_IN,
                json!({
                    "concept_id": link.concept_id,
                    "source_id": batch.source.id,
                    "document": batch.source.document,
                    "now": now,
                }),
            )
            .await?;
        }

        for instance in &batch.instances {
            tx.run(
                cypher::CREATE_INSTANCE,
                json!({
                    "id": instance.id.as_str(),
                    "concept_id": instance.concept_id,
                    "source_id": batch.source.id,
                    "quote": instance.quote,
                }),
            )
            .await?;
        }

        let merged = dedupe_relationships(&batch.relationships);
        for rel in &merged {
            tx.run(
                cypher::MERGE_RELATIONSHIP,
                json!({
                    "from": rel.from_concept,
                    "to": rel.to_concept,
                    "type": rel.rel_type.as_str(),
                    "confidence": rel.confidence,
                }),
            )
            .await?;
        }

        tx.commit().await?;

        let mut created_ids: HashSet<&str> = HashSet::new();
        let mut linked_ids: HashSet<&str> = HashSet::new();
        for link in &batch.concept_links {
            if link.created {
                created_ids.insert(link.concept_id.as_str());
            } else {
                linked_ids.insert(link.concept_id.as_str());
            }
        }

        let stats = ChunkWriteStats {
            concepts_created: created_ids.len() as u64,
            concepts_linked: linked_ids.len() as u64,
            instances_created: batch.instances.len() as u64,
            relationships_created: merged.len() as u64,
            sources_created: u64::from(source_is_new),
        };
        debug!(source = %batch.source.id, ?stats, "Chunk batch committed");
        Ok(stats)
    }
}

/// Collapse duplicate (from, to, type) triples to their max confidence and
/// drop self-edges, which can appear when two proposals in one chunk
/// resolved to the same concept.
fn dedupe_relationships(relationships: &[ConceptRelationship]) -> Vec<ConceptRelationship> {
    let mut merged: HashMap<(String, String, String), ConceptRelationship> = HashMap::new();
    for rel in relationships {
        if rel.from_concept == rel.to_concept {
            warn!(
                concept = %rel.from_concept,
                rel_type = %rel.rel_type,
                "Dropping self-relationship after resolution"
            );
            continue;
        }
        let key = (
            rel.from_concept.clone(),
            rel.to_concept.clone(),
            rel.rel_type.as_str().to_string(),
        );
        merged
            .entry(key)
            .and_modify(|existing| {
                if existing.confidence < rel.confidence {
                    existing.confidence = rel.confidence;
                }
            })
            .or_insert_with(|| rel.clone());
    }
    let mut result: Vec<ConceptRelationship> = merged.into_values().collect();
    result.sort_by(|a, b| {
        (&a.from_concept, &a.to_concept, a.rel_type.as_str())
            .cmp(&(&b.from_concept, &b.to_concept, b.rel_type.as_str()))
    });
    result
}
