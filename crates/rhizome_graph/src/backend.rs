//! Graph store contract.
//!
//! The engine expresses everything through a cypher-like query language with
//! parameter binding, transactional units, and a vector index search. A
//! backend only needs to support the queries in [`crate::cypher`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::GraphError;

/// One result row: column name to JSON value.
pub type Row = HashMap<String, Value>;

/// One vector index hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub node_id: String,
    pub score: f32,
}

#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Execute one auto-committed query.
    async fn run(&self, query: &str, params: Value) -> Result<Vec<Row>, GraphError>;

    /// Open a transactional unit. Writes staged through it become visible
    /// only at commit.
    async fn begin(&self) -> Result<Box<dyn GraphTx>, GraphError>;

    /// Top-k nodes of `label` by cosine similarity, filtered to `scope`'s
    /// ontology when given. Candidates with a different vector dimension
    /// are never returned.
    async fn vector_search(
        &self,
        label: &str,
        embedding: &[f32],
        k: usize,
        threshold: f32,
        scope: Option<&str>,
    ) -> Result<Vec<VectorHit>, GraphError>;

    /// Whether writes survive process restart. Non-durable backends must
    /// answer `false` so operators can be warned at startup.
    fn durable(&self) -> bool;
}

#[async_trait]
pub trait GraphTx: Send {
    /// Stage a write (or execute a read against committed state).
    async fn run(&mut self, query: &str, params: Value) -> Result<Vec<Row>, GraphError>;

    async fn commit(self: Box<Self>) -> Result<(), GraphError>;

    async fn rollback(self: Box<Self>) -> Result<(), GraphError>;
}
