//! Error types for clustermgr

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Store Errors ===
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {path}: expected {expected}, store has {actual}")]
    VersionConflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Placement Errors ===
    #[error("Invalid replication factor: {replicas} replicas requested for {nodes} nodes")]
    InvalidReplicationFactor { replicas: usize, nodes: usize },

    #[error("Invalid partition count: {0}")]
    InvalidPartitionCount(usize),

    #[error("Node pool is empty")]
    EmptyNodePool,

    // === Cluster Setup Errors ===
    #[error("Malformed node address (expected host:port): {0}")]
    MalformedNodeAddress(String),

    #[error("Cluster already exists: {0}")]
    ClusterExists(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a transient store failure worth retrying with backoff?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::StoreUnavailable(_) | Error::Io(_) | Error::RocksDb(_)
        )
    }

    /// Lost an optimistic-concurrency race; re-read and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. } | Error::AlreadyExists(_))
    }

    /// Caller input rejected before any work was done
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidReplicationFactor { .. }
                | Error::InvalidPartitionCount(_)
                | Error::EmptyNodePool
                | Error::MalformedNodeAddress(_)
                | Error::InvalidConfig(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
