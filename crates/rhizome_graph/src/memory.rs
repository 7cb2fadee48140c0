//! Embedded in-memory graph backend.
//!
//! Implements the query catalog for tests and single-node development. Not
//! durable; `durable()` answers `false` and `serve` warns when it is
//! selected. Transactions stage writes and apply them to a copy of the
//! state at commit, so a failed chunk batch is never partially observable.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::backend::{GraphBackend, GraphTx, Row, VectorHit};
use crate::cosine_similarity;
use crate::cypher;
use crate::error::GraphError;

#[derive(Debug, Clone, Default)]
pub struct ConceptRecord {
    pub id: String,
    pub label: String,
    pub ontology: String,
    pub embedding: Vec<f32>,
    pub search_terms: Vec<String>,
    pub documents: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceRecord {
    pub id: String,
    pub document: String,
    pub chunk_index: u32,
    pub full_text: String,
    pub word_count: u32,
    pub ontology: String,
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub concept_id: String,
    pub source_id: String,
    pub quote: String,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    concepts: HashMap<String, ConceptRecord>,
    sources: HashMap<String, SourceRecord>,
    instances: Vec<InstanceRecord>,
    /// (from, to, type) -> confidence
    relationships: HashMap<(String, String, String), f64>,
    appears_in: HashSet<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MemoryGraph {
    state: Arc<Mutex<GraphState>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Inspection helpers for tests and diagnostics
    // ------------------------------------------------------------------

    pub fn concept_count(&self) -> usize {
        self.lock().concepts.len()
    }

    pub fn concepts(&self) -> Vec<ConceptRecord> {
        self.lock().concepts.values().cloned().collect()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn source(&self, id: &str) -> Option<SourceRecord> {
        self.lock().sources.get(id).cloned()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.lock().instances.clone()
    }

    pub fn instances_for_concept(&self, concept_id: &str) -> Vec<InstanceRecord> {
        self.lock()
            .instances
            .iter()
            .filter(|i| i.concept_id == concept_id)
            .cloned()
            .collect()
    }

    pub fn relationship_confidence(&self, from: &str, to: &str, rel_type: &str) -> Option<f64> {
        self.lock()
            .relationships
            .get(&(from.to_string(), to.to_string(), rel_type.to_string()))
            .copied()
    }

    pub fn relationship_count(&self) -> usize {
        self.lock().relationships.len()
    }

    pub fn appears_in(&self, concept_id: &str, source_id: &str) -> bool {
        self.lock()
            .appears_in
            .contains(&(concept_id.to_string(), source_id.to_string()))
    }
}

// ----------------------------------------------------------------------
// Query execution
// ----------------------------------------------------------------------

fn param<'a>(params: &'a Value, name: &'static str) -> Result<&'a Value, GraphError> {
    params
        .get(name)
        .ok_or(GraphError::BadParameter { name })
}

fn str_param<'a>(params: &'a Value, name: &'static str) -> Result<&'a str, GraphError> {
    param(params, name)?
        .as_str()
        .ok_or(GraphError::BadParameter { name })
}

fn f64_param(params: &Value, name: &'static str) -> Result<f64, GraphError> {
    param(params, name)?
        .as_f64()
        .ok_or(GraphError::BadParameter { name })
}

fn u32_param(params: &Value, name: &'static str) -> Result<u32, GraphError> {
    param(params, name)?
        .as_u64()
        .map(|v| v as u32)
        .ok_or(GraphError::BadParameter { name })
}

fn vec_f32_param(params: &Value, name: &'static str) -> Result<Vec<f32>, GraphError> {
    param(params, name)?
        .as_array()
        .map(|values| {
            values
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
        })
        .flatten()
        .ok_or(GraphError::BadParameter { name })
}

fn vec_string_param(params: &Value, name: &'static str) -> Result<Vec<String>, GraphError> {
    param(params, name)?
        .as_array()
        .map(|values| {
            values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
        })
        .flatten()
        .ok_or(GraphError::BadParameter { name })
}

fn is_read_query(query: &str) -> bool {
    query == cypher::GET_CONCEPT
        || query == cypher::LIST_CONCEPT_TERMS
        || query == cypher::SOURCE_EXISTS
}

fn apply(state: &mut GraphState, query: &str, params: &Value) -> Result<Vec<Row>, GraphError> {
    if query == cypher::GET_CONCEPT {
        let id = str_param(params, "id")?;
        let mut rows = Vec::new();
        if let Some(concept) = state.concepts.get(id) {
            let mut row = Row::new();
            row.insert("id".into(), Value::String(concept.id.clone()));
            row.insert("label".into(), Value::String(concept.label.clone()));
            row.insert("ontology".into(), Value::String(concept.ontology.clone()));
            row.insert("dimension".into(), Value::from(concept.embedding.len()));
            rows.push(row);
        }
        return Ok(rows);
    }

    if query == cypher::LIST_CONCEPT_TERMS {
        let ontology = str_param(params, "ontology")?;
        let mut rows = Vec::new();
        for concept in state.concepts.values() {
            if concept.ontology != ontology {
                continue;
            }
            let mut row = Row::new();
            row.insert("id".into(), Value::String(concept.id.clone()));
            row.insert(
                "search_terms".into(),
                Value::Array(
                    concept
                        .search_terms
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
            rows.push(row);
        }
        return Ok(rows);
    }

    if query == cypher::SOURCE_EXISTS {
        let id = str_param(params, "id")?;
        let mut rows = Vec::new();
        if state.sources.contains_key(id) {
            let mut row = Row::new();
            row.insert("id".into(), Value::String(id.to_string()));
            rows.push(row);
        }
        return Ok(rows);
    }

    if query == cypher::CREATE_CONCEPT {
        let id = str_param(params, "id")?.to_string();
        if state.concepts.contains_key(&id) {
            return Err(GraphError::Backend(format!("concept {id:?} already exists")));
        }
        let now = str_param(params, "now")?.to_string();
        let record = ConceptRecord {
            id: id.clone(),
            label: str_param(params, "label")?.to_string(),
            ontology: str_param(params, "ontology")?.to_string(),
            embedding: vec_f32_param(params, "embedding")?,
            search_terms: vec_string_param(params, "search_terms")?,
            documents: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        state.concepts.insert(id, record);
        return Ok(Vec::new());
    }

    if query == cypher::MERGE_SOURCE {
        let id = str_param(params, "id")?.to_string();
        if !state.sources.contains_key(&id) {
            let record = SourceRecord {
                id: id.clone(),
                document: str_param(params, "document")?.to_string(),
                chunk_index: u32_param(params, "chunk_index")?,
                full_text: str_param(params, "full_text")?.to_string(),
                word_count: u32_param(params, "word_count")?,
                ontology: str_param(params, "ontology")?.to_string(),
            };
            state.sources.insert(id, record);
        }
        return Ok(Vec::new());
    }

    if query == cypher::CREATE_INSTANCE {
        let concept_id = str_param(params, "concept_id")?;
        let source_id = str_param(params, "source_id")?;
        if !state.concepts.contains_key(concept_id) {
            return Err(GraphError::MissingNode(concept_id.to_string()));
        }
        if !state.sources.contains_key(source_id) {
            return Err(GraphError::MissingNode(source_id.to_string()));
        }
        state.instances.push(InstanceRecord {
            id: str_param(params, "id")?.to_string(),
            concept_id: concept_id.to_string(),
            source_id: source_id.to_string(),
            quote: str_param(params, "quote")?.to_string(),
        });
        return Ok(Vec::new());
    }

    if query == cypher::MERGE_RELATIONSHIP {
        let from = str_param(params, "from")?;
        let to = str_param(params, "to")?;
        if !state.concepts.contains_key(from) {
            return Err(GraphError::MissingNode(from.to_string()));
        }
        if !state.concepts.contains_key(to) {
            return Err(GraphError::MissingNode(to.to_string()));
        }
        let rel_type = str_param(params, "type")?.to_string();
        let confidence = f64_param(params, "confidence")?;
        let key = (from.to_string(), to.to_string(), rel_type);
        let entry = state.relationships.entry(key).or_insert(confidence);
        if *entry < confidence {
            *entry = confidence;
        }
        return Ok(Vec::new());
    }

    if query == cypher::MERGE_APPEARS_IN {
        let concept_id = str_param(params, "concept_id")?.to_string();
        let source_id = str_param(params, "source_id")?.to_string();
        let document = str_param(params, "document")?.to_string();
        let now = str_param(params, "now")?.to_string();
        if !state.sources.contains_key(&source_id) {
            return Err(GraphError::MissingNode(source_id));
        }
        let concept = state
            .concepts
            .get_mut(&concept_id)
            .ok_or_else(|| GraphError::MissingNode(concept_id.clone()))?;
        if !concept.documents.contains(&document) {
            concept.documents.push(document);
        }
        concept.updated_at = now;
        state.appears_in.insert((concept_id, source_id));
        return Ok(Vec::new());
    }

    Err(GraphError::UnsupportedQuery(
        query.lines().take(2).collect::<Vec<_>>().join(" "),
    ))
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn run(&self, query: &str, params: Value) -> Result<Vec<Row>, GraphError> {
        let mut state = self.lock();
        apply(&mut state, query, &params)
    }

    async fn begin(&self) -> Result<Box<dyn GraphTx>, GraphError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn vector_search(
        &self,
        label: &str,
        embedding: &[f32],
        k: usize,
        threshold: f32,
        scope: Option<&str>,
    ) -> Result<Vec<VectorHit>, GraphError> {
        if label != "Concept" {
            return Err(GraphError::UnsupportedQuery(format!(
                "vector index on label {label:?}"
            )));
        }
        let state = self.lock();
        let mut hits: Vec<VectorHit> = state
            .concepts
            .values()
            .filter(|c| scope.map_or(true, |ontology| c.ontology == ontology))
            .filter_map(|c| {
                // Cross-dimension candidates are silently excluded.
                cosine_similarity(&c.embedding, embedding).map(|score| VectorHit {
                    node_id: c.id.clone(),
                    score,
                })
            })
            .filter(|hit| hit.score >= threshold)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    fn durable(&self) -> bool {
        false
    }
}

struct MemoryTx {
    state: Arc<Mutex<GraphState>>,
    staged: Vec<(String, Value)>,
}

#[async_trait]
impl GraphTx for MemoryTx {
    async fn run(&mut self, query: &str, params: Value) -> Result<Vec<Row>, GraphError> {
        if is_read_query(query) {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            return apply(&mut state, query, &params);
        }
        self.staged.push((query.to_string(), params));
        Ok(Vec::new())
    }

    async fn commit(self: Box<Self>) -> Result<(), GraphError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Apply against a copy so a mid-batch failure leaves nothing behind.
        let mut draft = state.clone();
        for (query, params) in &self.staged {
            apply(&mut draft, query, params)?;
        }
        *state = draft;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GraphError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn concept_params(id: &str, ontology: &str, embedding: Vec<f32>) -> Value {
        json!({
            "id": id,
            "label": id,
            "ontology": ontology,
            "embedding": embedding,
            "search_terms": ["term"],
            "now": Utc::now().to_rfc3339(),
        })
    }

    #[tokio::test]
    async fn test_create_and_get_concept() {
        let graph = MemoryGraph::new();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("a-concept", "notes", vec![1.0, 0.0]))
            .await
            .unwrap();

        let rows = graph
            .run(cypher::GET_CONCEPT, json!({"id": "a-concept"}))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["dimension"], json!(2));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let graph = MemoryGraph::new();
        let params = concept_params("dup", "notes", vec![1.0]);
        graph.run(cypher::CREATE_CONCEPT, params.clone()).await.unwrap();
        assert!(graph.run(cypher::CREATE_CONCEPT, params).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_query_rejected() {
        let graph = MemoryGraph::new();
        let err = graph
            .run("MATCH (n) DETACH DELETE n", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::UnsupportedQuery(_)));
    }

    #[tokio::test]
    async fn test_tx_atomicity_on_failure() {
        let graph = MemoryGraph::new();
        let mut tx = graph.begin().await.unwrap();
        tx.run(
            cypher::MERGE_SOURCE,
            json!({
                "id": "doc#0", "document": "doc", "chunk_index": 0,
                "full_text": "text", "word_count": 1, "ontology": "notes",
            }),
        )
        .await
        .unwrap();
        // References a concept that does not exist: commit must fail and
        // leave no source behind.
        tx.run(
            cypher::CREATE_INSTANCE,
            json!({
                "id": "i-1", "concept_id": "ghost", "source_id": "doc#0", "quote": "text",
            }),
        )
        .await
        .unwrap();

        assert!(tx.commit().await.is_err());
        assert!(graph.source_ids().is_empty());
    }

    #[tokio::test]
    async fn test_merge_relationship_takes_max_confidence() {
        let graph = MemoryGraph::new();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("a", "notes", vec![1.0]))
            .await
            .unwrap();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("b", "notes", vec![0.5]))
            .await
            .unwrap();

        for confidence in [0.4, 0.9, 0.6] {
            let mut tx = graph.begin().await.unwrap();
            tx.run(
                cypher::MERGE_RELATIONSHIP,
                json!({"from": "a", "to": "b", "type": "IMPLIES", "confidence": confidence}),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        assert_eq!(graph.relationship_count(), 1);
        assert_eq!(graph.relationship_confidence("a", "b", "IMPLIES"), Some(0.9));
    }

    #[tokio::test]
    async fn test_vector_search_scoped_and_thresholded() {
        let graph = MemoryGraph::new();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("close", "notes", vec![1.0, 0.0]))
            .await
            .unwrap();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("far", "notes", vec![0.0, 1.0]))
            .await
            .unwrap();
        graph
            .run(
                cypher::CREATE_CONCEPT,
                concept_params("other-ontology", "papers", vec![1.0, 0.0]),
            )
            .await
            .unwrap();

        let hits = graph
            .vector_search("Concept", &[1.0, 0.1], 5, 0.85, Some("notes"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id, "close");
    }

    #[tokio::test]
    async fn test_vector_search_skips_other_dimensions() {
        let graph = MemoryGraph::new();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("three-d", "notes", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        let hits = graph
            .vector_search("Concept", &[1.0, 0.0], 5, 0.0, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_merge_source_idempotent() {
        let graph = MemoryGraph::new();
        let params = json!({
            "id": "doc#0", "document": "doc", "chunk_index": 0,
            "full_text": "text", "word_count": 1, "ontology": "notes",
        });
        graph.run(cypher::MERGE_SOURCE, params.clone()).await.unwrap();
        graph.run(cypher::MERGE_SOURCE, params).await.unwrap();
        assert_eq!(graph.source_ids(), vec!["doc#0".to_string()]);
    }

    #[tokio::test]
    async fn test_appears_in_extends_documents_once() {
        let graph = MemoryGraph::new();
        graph
            .run(cypher::CREATE_CONCEPT, concept_params("c", "notes", vec![1.0]))
            .await
            .unwrap();
        graph
            .run(
                cypher::MERGE_SOURCE,
                json!({
                    "id": "doc#0", "document": "doc", "chunk_index": 0,
                    "full_text": "text", "word_count": 1, "ontology": "notes",
                }),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let mut tx = graph.begin().await.unwrap();
            tx.run(
                cypher::MERGE_APPEARS_IN,
                json!({
                    "concept_id": "c", "source_id": "doc#0",
                    "document": "doc", "now": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let concepts = graph.concepts();
        assert_eq!(concepts[0].documents, vec!["doc".to_string()]);
        assert!(graph.appears_in("c", "doc#0"));
    }
}
