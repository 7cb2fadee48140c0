//! Graph layer: the store contract, the upsert engine, and concept identity
//! resolution.
//!
//! The engine speaks a property-graph query language through
//! [`GraphBackend`]; every query it issues comes from the catalog in
//! [`cypher`], so alternative backends know the exact surface they must
//! support. The embedded [`MemoryGraph`] backend implements that surface
//! in-process and is explicitly non-durable.

pub mod backend;
pub mod cypher;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod types;
pub mod upsert;

pub use backend::{GraphBackend, GraphTx, Row, VectorHit};
pub use error::GraphError;
pub use memory::MemoryGraph;
pub use resolver::{ConceptProposal, ConceptResolver, ResolvedConcept, ResolverConfig};
pub use types::{ConceptRelationship, NewInstance, RelationType, SourceNode};
pub use upsert::{ChunkBatch, ChunkWriteStats, ConceptLink, UpsertEngine};

/// Cosine similarity; `None` when dimensions differ, 0.0 for zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), Some(0.0));
    }
}
