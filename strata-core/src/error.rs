//! Error types for worker threads and slot pools.

use thiserror::Error;

/// Errors raised while managing a worker thread.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised when a claim is handed back to a pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Slot claim belongs to pool {claim_pool}, not pool {pool}")]
    ForeignClaim { pool: u64, claim_pool: u64 },

    #[error("Slot {index} was claimed for reading and cannot be published")]
    WrongRole { index: usize },
}
