//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("machine index {index} of node {node} is already held by {holder}")]
    DuplicateMachineIndex {
        index: u16,
        node: String,
        holder: String,
    },

    #[error("backend not compiled in: {0} (enable the `{0}` feature)")]
    BackendUnavailable(&'static str),

    // ==================== Coordination Errors ====================
    #[error("not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("session expired")]
    SessionExpired,

    #[error("lease lost: {0}")]
    LeaseLost(i64),

    // ==================== Metadata Errors ====================
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {key}: expected version {expected}")]
    VersionConflict { key: String, expected: i32 },

    #[error("too many retries: {0}")]
    TooManyRetries(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Storage Errors ====================
    #[error("local store error: {0}")]
    Storage(String),

    #[error("remote backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Build a not-found error for a metadata entity
    pub fn entity_not_found(kind: impl std::fmt::Display, id: u64) -> Self {
        ClusterError::NotFound(format!("{} {}", kind, id))
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Unavailable(_)
                | ClusterError::Timeout(_)
                | ClusterError::SessionExpired
                | ClusterError::LeaseLost(_)
                | ClusterError::NotLeader { .. }
                | ClusterError::VersionConflict { .. }
        )
    }

    /// Check if this error means the entity or key is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Check if this error is an optimistic-concurrency collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::VersionConflict { .. })
    }

    /// Errors the admin surface reports as caller mistakes (4xx) rather than
    /// server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ClusterError::NotFound(_)
                | ClusterError::AlreadyExists(_)
                | ClusterError::VersionConflict { .. }
                | ClusterError::NotLeader { .. }
        )
    }

    /// Check if this is a fatal error requiring the process to refuse to start
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidConfig(_)
                | ClusterError::DuplicateMachineIndex { .. }
                | ClusterError::BackendUnavailable(_)
                | ClusterError::Storage(_)
        )
    }

    /// Get the leader identity if this is a NotLeader error
    pub fn leader(&self) -> Option<&str> {
        match self {
            ClusterError::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }
}

// ==================== Local store (redb) ====================

impl From<redb::DatabaseError> for ClusterError {
    fn from(e: redb::DatabaseError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for ClusterError {
    fn from(e: redb::TransactionError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for ClusterError {
    fn from(e: redb::TableError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for ClusterError {
    fn from(e: redb::StorageError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for ClusterError {
    fn from(e: redb::CommitError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

// ==================== Serialization ====================

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

// ==================== Runtime ====================

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout("deadline elapsed".to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}

// ==================== Remote backends ====================

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for ClusterError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            // ER_DUP_ENTRY
            mysql_async::Error::Server(ref server) if server.code == 1062 => {
                ClusterError::AlreadyExists(server.message.clone())
            }
            mysql_async::Error::Io(_) => ClusterError::Unavailable(e.to_string()),
            _ => ClusterError::Backend(e.to_string()),
        }
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for ClusterError {
    fn from(e: etcd_client::Error) -> Self {
        match e {
            etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
                ClusterError::Unavailable(e.to_string())
            }
            _ => ClusterError::Backend(e.to_string()),
        }
    }
}
