//! Graph layer errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("query not in the supported catalog: {0:?}")]
    UnsupportedQuery(String),

    #[error("missing or mistyped parameter {name:?} for query")]
    BadParameter { name: &'static str },

    #[error("referenced node {0:?} does not exist")]
    MissingNode(String),

    #[error("embedding dimension {got} does not match query dimension {want}")]
    DimensionMismatch { want: usize, got: usize },

    #[error("transaction already closed")]
    TxClosed,

    #[error("invalid relationship type {0:?}")]
    BadRelationType(String),

    #[error("graph backend error: {0}")]
    Backend(String),
}
