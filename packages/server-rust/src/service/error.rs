//! Error types shared by the pool, lifecycle, and stage layers.

use handoff_core::{ExternalServiceError, SessionError};

use crate::storage::{DaoError, ProviderError, TxError};

/// Errors returned by a [`WorkerPool`](super::pool::WorkerPool).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool {pool} must have at least one thread")]
    InvalidSize { pool: String },
    #[error("worker pool {pool} is shut down and accepts no new tasks")]
    ShutDown { pool: String },
    #[error("failed to spawn a worker thread for pool {pool}")]
    Spawn {
        pool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration errors. Raised at startup or on a lookup of something that
/// was never declared; both are fatal wiring mistakes, not data conditions.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("resource group {name} is not declared")]
    UnknownGroup { name: String },
    #[error("resource group {name} is declared more than once")]
    DuplicateGroup { name: String },
    #[error("resource group name must not be empty")]
    EmptyGroupName,
    #[error("resource group {name} has no session factory")]
    MissingFactory { name: String },
    #[error("resource group {name} has a session factory of a different type")]
    FactoryTypeMismatch { name: String },
    #[error("resource group {name} must have a pool size of at least 1")]
    InvalidPoolSize { name: String },
    #[error("resource group {name} must allow at least one connection")]
    InvalidConnectionCount { name: String },
    #[error("{flow} flow requires a {expected} group, but {name} is not one")]
    WrongGroupKind {
        flow: &'static str,
        name: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A failure caught at a pipeline stage boundary.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Dao(#[from] DaoError),
    #[error(transparent)]
    Transaction(#[from] TxError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    External(#[from] ExternalServiceError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}
