//! Concept identity resolution.
//!
//! Maps an extracted concept proposal to an existing concept id or creates
//! a new one. Create decisions are serialized per ontology, and the vector
//! match is re-checked inside that critical section, so two chunks racing
//! on the same phrase cannot both create a node.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use chrono::Utc;
use rhizome_protocol::config::defaults;
use rhizome_protocol::FallbackPolicy;

use crate::backend::GraphBackend;
use crate::cypher;
use crate::error::GraphError;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub match_threshold: f32,
    pub ontology_scoped: bool,
    pub fallback: FallbackPolicy,
    pub jaccard_threshold: f32,
    pub top_k: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            match_threshold: defaults::MATCH_THRESHOLD,
            ontology_scoped: true,
            fallback: FallbackPolicy::default(),
            jaccard_threshold: defaults::SEARCH_TERM_JACCARD,
            top_k: 5,
        }
    }
}

/// An extracted concept ready for resolution; the embedding is computed by
/// the worker before resolution starts.
#[derive(Debug, Clone)]
pub struct ConceptProposal {
    pub proposed_id: String,
    pub label: String,
    pub search_terms: Vec<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConcept {
    pub concept_id: String,
    /// True when this resolution allocated a new node.
    pub created: bool,
}

pub struct ConceptResolver {
    backend: Arc<dyn GraphBackend>,
    config: ResolverConfig,
    ontology_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConceptResolver {
    pub fn new(backend: Arc<dyn GraphBackend>, config: ResolverConfig) -> Self {
        Self {
            backend,
            config,
            ontology_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        ontology: &str,
        proposal: &ConceptProposal,
    ) -> Result<ResolvedConcept, GraphError> {
        if proposal.embedding.is_empty() {
            return Err(GraphError::DimensionMismatch { want: 1, got: 0 });
        }

        // Step 1: the extractor already knows this concept.
        if self.concept_exists(&proposal.proposed_id).await? {
            debug!(concept = %proposal.proposed_id, "Resolved by proposed id");
            return Ok(ResolvedConcept {
                concept_id: proposal.proposed_id.clone(),
                created: false,
            });
        }

        // Steps 3-4: vector match against the scoped index. Candidates with
        // another embedding dimension are excluded by the backend contract.
        if let Some(hit) = self.vector_match(ontology, &proposal.embedding).await? {
            debug!(concept = %hit, label = %proposal.label, "Resolved by vector match");
            return Ok(ResolvedConcept {
                concept_id: hit,
                created: false,
            });
        }

        // Step 5: search-term overlap fallback.
        if let Some(candidate) = self.search_term_match(ontology, &proposal.search_terms).await? {
            info!(
                concept = %candidate,
                label = %proposal.label,
                ontology,
                "Potential duplicate: search terms overlap without vector match"
            );
            if self.config.fallback == FallbackPolicy::Reuse {
                return Ok(ResolvedConcept {
                    concept_id: candidate,
                    created: false,
                });
            }
        }

        // Step 6: create, serialized per ontology. The vector match is
        // re-run under the lock because a racing resolver may have created
        // the node after our check above.
        let lock = self.ontology_lock(ontology);
        let _guard = lock.lock().await;

        if let Some(hit) = self.vector_match(ontology, &proposal.embedding).await? {
            debug!(concept = %hit, "Race resolved inside critical section");
            return Ok(ResolvedConcept {
                concept_id: hit,
                created: false,
            });
        }

        let concept_id = self.allocate_slug(&proposal.label).await?;
        self.backend
            .run(
                cypher::CREATE_CONCEPT,
                json!({
                    "id": concept_id,
                    "label": proposal.label,
                    "ontology": ontology,
                    "embedding": proposal.embedding,
                    "search_terms": proposal.search_terms,
                    "now": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        info!(concept = %concept_id, label = %proposal.label, ontology, "Created concept");
        Ok(ResolvedConcept {
            concept_id,
            created: true,
        })
    }

    async fn concept_exists(&self, id: &str) -> Result<bool, GraphError> {
        let rows = self
            .backend
            .run(cypher::GET_CONCEPT, json!({ "id": id }))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn vector_match(
        &self,
        ontology: &str,
        embedding: &[f32],
    ) -> Result<Option<String>, GraphError> {
        let scope = self.config.ontology_scoped.then_some(ontology);
        let hits = self
            .backend
            .vector_search(
                "Concept",
                embedding,
                self.config.top_k,
                self.config.match_threshold,
                scope,
            )
            .await?;
        Ok(hits.into_iter().next().map(|hit| hit.node_id))
    }

    async fn search_term_match(
        &self,
        ontology: &str,
        terms: &[String],
    ) -> Result<Option<String>, GraphError> {
        if terms.is_empty() {
            return Ok(None);
        }
        let proposed: HashSet<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let rows = self
            .backend
            .run(cypher::LIST_CONCEPT_TERMS, json!({ "ontology": ontology }))
            .await?;

        let mut best: Option<(String, f32)> = None;
        for row in rows {
            let Some(id) = row.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let existing: HashSet<String> = row
                .get("search_terms")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_lowercase)
                        .collect()
                })
                .unwrap_or_default();
            let score = jaccard(&proposed, &existing);
            if score >= self.config.jaccard_threshold
                && best.as_ref().map_or(true, |(_, s)| score > *s)
            {
                best = Some((id.to_string(), score));
            }
        }
        Ok(best.map(|(id, _)| id))
    }

    async fn allocate_slug(&self, label: &str) -> Result<String, GraphError> {
        let base = slugify(label);
        if !self.concept_exists(&base).await? {
            return Ok(base);
        }
        for n in 2..1000 {
            let candidate = format!("{base}-{n}");
            if !self.concept_exists(&candidate).await? {
                warn!(slug = %candidate, label, "Slug collision, de-collided with suffix");
                return Ok(candidate);
            }
        }
        Err(GraphError::Backend(format!(
            "could not de-collide slug for label {label:?}"
        )))
    }

    fn ontology_lock(&self, ontology: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .ontology_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(ontology.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Kebab-case slug from a label; alphanumeric runs joined with dashes.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut last_dash = true;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "concept".to_string()
    } else {
        slug
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}
