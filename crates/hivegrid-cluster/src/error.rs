//! Cluster error types.

use thiserror::Error;

/// Errors that can occur during pool operations.
///
/// Expected conditions (unknown worker on a settings update, no overload)
/// never surface as errors across the manager boundary; they come back as
/// `Ok(false)` / `Ok(None)` with a diagnostic. These variants are for
/// operations that were asked to do something and could not.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node has no workers to migrate: {0}")]
    NoMigrationCandidate(String),

    #[error("invalid settings patch: {0}")]
    ConfigMerge(String),

    #[error("state store error: {0}")]
    State(#[from] hivegrid_state::StateError),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
