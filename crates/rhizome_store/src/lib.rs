//! Durable job store.
//!
//! Every job mutation goes through [`JobStore`]; arbitrary writes to the
//! jobs table are forbidden. Status transitions are conditional updates that
//! fail with [`StoreError::StaleState`] when the job is not in the expected
//! state, and `claim_next` is the sole mechanism by which workers acquire
//! work.

mod error;
mod row;
mod schema;
mod store;

pub use error::StoreError;
pub use store::{JobFilter, JobStore, NewJob, QueueStats, ReapOutcome};
