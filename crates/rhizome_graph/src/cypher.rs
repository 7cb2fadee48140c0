//! The canonical query catalog.
//!
//! Every statement the upsert engine or resolver sends to a backend is one
//! of these constants. Backends may pattern-match on them; the embedded
//! memory backend rejects anything else, which keeps the two sides honest.

/// Read one concept's identity fields.
pub const GET_CONCEPT: &str = r#"
MATCH (c:Concept {id: $id})
RETURN c.id AS id, c.label AS label, c.ontology AS ontology, c.dimension AS dimension
"#;

/// List concept ids and search terms within one ontology, for the
/// search-term fallback.
pub const LIST_CONCEPT_TERMS: &str = r#"
MATCH (c:Concept)
WHERE c.ontology = $ontology
RETURN c.id AS id, c.search_terms AS search_terms
"#;

/// Create a concept node. Issued only from inside the resolver's critical
/// section, auto-committed so concurrent resolvers observe it immediately.
pub const CREATE_CONCEPT: &str = r#"
CREATE (c:Concept {
    id: $id, label: $label, ontology: $ontology,
    embedding: $embedding, search_terms: $search_terms,
    documents: [], created_at: $now, updated_at: $now
})
"#;

/// Idempotent source creation; a re-run of an already-committed chunk is a
/// no-op.
pub const MERGE_SOURCE: &str = r#"
MERGE (s:Source {id: $id})
ON CREATE SET s.document = $document, s.chunk_index = $chunk_index,
              s.full_text = $full_text, s.word_count = $word_count,
              s.ontology = $ontology
"#;

/// Probe for a committed chunk.
pub const SOURCE_EXISTS: &str = r#"
MATCH (s:Source {id: $id})
RETURN s.id AS id
"#;

/// Evidence triangle: concept -[:EVIDENCED_BY]-> instance -[:FROM_SOURCE]-> source.
pub const CREATE_INSTANCE: &str = r#"
MATCH (c:Concept {id: $concept_id}), (s:Source {id: $source_id})
CREATE (i:Instance {id: $id, quote: $quote}),
       (c)-[:EVIDENCED_BY]->(i),
       (i)-[:FROM_SOURCE]->(s)
"#;

/// Directed concept edge, unique per (from, to, type); confidence takes the
/// max over all writes.
pub const MERGE_RELATIONSHIP: &str = r#"
MATCH (a:Concept {id: $from}), (b:Concept {id: $to})
MERGE (a)-[r:RELATED {type: $type}]->(b)
ON CREATE SET r.confidence = $confidence
ON MATCH SET r.confidence =
    CASE WHEN r.confidence < $confidence THEN $confidence ELSE r.confidence END
"#;

/// Concept provenance: APPEARS_IN edge plus documents-set extension.
pub const MERGE_APPEARS_IN: &str = r#"
MATCH (c:Concept {id: $concept_id}), (s:Source {id: $source_id})
MERGE (c)-[:APPEARS_IN]->(s)
SET c.documents = CASE WHEN $document IN c.documents
                       THEN c.documents ELSE c.documents + $document END,
    c.updated_at = $now
"#;
