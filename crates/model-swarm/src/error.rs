//! Error types for the model swarm.
//!
//! Errors are split by collaborator: [`StorageError`] for the durable store,
//! [`TransportError`] for chunk exchange, and [`SwarmError`] for everything the
//! node and coordinator surface to their callers.

use thiserror::Error;

/// Errors raised by a [`PoolStore`](crate::storage::PoolStore) implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record the caller referenced does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A record with the same key already exists
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// Backend failure (connection, query, constraint)
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while moving chunks between peers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The remote peer is not reachable through this transport
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The remote peer does not hold the requested chunk
    #[error("Peer {peer_id} does not have chunk {chunk_id}")]
    ChunkNotHeld { peer_id: String, chunk_id: String },

    /// The transfer started but did not complete
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The request did not complete within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by nodes and the network coordinator.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A locator string could not be parsed
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Chunk size must be non-zero
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// The payload would need more chunks than a chunk index can address
    #[error("{total_size} bytes at {chunk_size} bytes per chunk exceeds the chunk index range")]
    TooManyChunks { total_size: usize, chunk_size: usize },

    /// Reassembly found gaps in the index range
    #[error("Missing {} chunk(s) for reassembly: {missing:?}", missing.len())]
    MissingChunks { missing: Vec<u32> },

    /// A chunk's content does not match its advertised hash
    #[error("Hash mismatch for chunk {chunk_id}")]
    HashMismatch { chunk_id: String },

    /// No peer could supply a chunk after all retries
    #[error("Chunk {chunk_id} unavailable after {attempts} attempt(s): {source}")]
    ChunkUnavailable {
        chunk_id: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The node does not participate in the resource
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// A resource update carried a version that is not newer than the local one
    #[error("Stale version for {resource_id}: {version} <= {current}")]
    StaleVersion {
        resource_id: String,
        version: u64,
        current: u64,
    },

    /// The source model has not been staged locally
    #[error("Source model {0} must be downloaded first")]
    ModelNotStaged(String),

    /// The source model is not in the repository catalog
    #[error("Source model {0} not found in repository")]
    ModelNotFound(String),

    /// The source model is staged but its path could not be resolved
    #[error("Source model {0} path not available")]
    ModelPathUnavailable(String),

    /// The pool does not exist in durable storage or the torrent table
    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    /// No participant is registered under the identity
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for swarm operations
pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chunks_message_counts_indices() {
        let err = SwarmError::MissingChunks {
            missing: vec![3, 7],
        };
        assert_eq!(
            err.to_string(),
            "Missing 2 chunk(s) for reassembly: [3, 7]"
        );
    }

    #[test]
    fn test_storage_error_converts() {
        let err: SwarmError = StorageError::NotFound {
            entity: "pool",
            id: "p1".to_string(),
        }
        .into();
        assert!(matches!(err, SwarmError::Storage(_)));
        assert_eq!(err.to_string(), "pool not found: p1");
    }
}
