//! Remote replicated store
//!
//! The authoritative copy of configuration entities and run-state in cluster
//! mode. Two interchangeable backends implement the same traits:
//!
//! - [`TreeBackend`]: a ZooKeeper-style tree service. Payloads are gzipped and
//!   the entity version is the node's native version plus one.
//! - `MySqlBackend` (feature `mysql`): one row per entity with an explicit
//!   version column bumped by a conditional `UPDATE`.
//!
//! Both guarantee that an insert of an existing id fails, that deleting an
//! absent id succeeds and that an update carrying a stale version fails with
//! [`ClusterError::VersionConflict`] without touching the stored payload.

pub mod memory;
pub mod tree;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use crate::error::{ClusterError, Result};
use crate::model::{MetadataKind, MetadataVersion, PipelineState, Position};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::{MemoryTree, MemoryTreeClient};
pub use tree::{
    CreateMode, SessionInfo, SessionState, TreeBackend, TreeClient, TreeEvent, TreeEventKind,
};

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;

#[cfg(feature = "zookeeper")]
pub use zookeeper::ZookeeperTree;

/// Notification that a remote entity was created, changed or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataChange {
    pub kind: MetadataKind,
    pub id: u64,
}

/// Versioned storage for configuration entities
///
/// Payloads cross this boundary as plain serialized entities; any transport
/// encoding is the backend's concern.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Short backend name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Create parents or tables; idempotent
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    /// Store a new entity at version 1; fails with `AlreadyExists`
    async fn insert(&self, kind: MetadataKind, id: u64, payload: &[u8]) -> Result<()>;

    /// Remove an entity; absent ids succeed
    async fn delete(&self, kind: MetadataKind, id: u64) -> Result<()>;

    /// Replace the payload if the stored version equals `expected`,
    /// returning the new version (`expected + 1`)
    async fn update(&self, kind: MetadataKind, id: u64, expected: i32, payload: &[u8])
        -> Result<i32>;

    /// Current version; fails with `NotFound`
    async fn get_version(&self, kind: MetadataKind, id: u64) -> Result<i32>;

    /// Payload and version; fails with `NotFound`
    async fn get(&self, kind: MetadataKind, id: u64) -> Result<(Vec<u8>, i32)>;

    /// `{id, version}` of every stored entity of `kind`
    async fn list_versions(&self, kind: MetadataKind) -> Result<Vec<MetadataVersion>>;

    /// Push notifications for remote changes, if the backend supports them
    async fn watch_changes(&self) -> Result<Option<mpsc::UnboundedReceiver<MetadataChange>>> {
        Ok(None)
    }
}

/// Remote run-state, binlog positions and machine indices
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    /// Stable machine index of `node`, allocated on first sight
    async fn machine_index(&self, node: &str) -> Result<u16>;

    async fn position_exists(&self, pipeline_id: u64) -> Result<bool>;

    async fn create_position(&self, pipeline_id: u64, position: &Position) -> Result<()>;

    async fn update_position(&self, pipeline_id: u64, position: &Position) -> Result<()>;

    async fn get_position(&self, pipeline_id: u64) -> Result<Option<Position>>;

    async fn state_exists(&self, pipeline_id: u64) -> Result<bool>;

    async fn create_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()>;

    async fn update_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()>;

    async fn get_state(&self, pipeline_id: u64) -> Result<Option<PipelineState>>;

    /// Remove both the position and the run-state of a pipeline
    async fn delete_run_state(&self, pipeline_id: u64) -> Result<()>;
}

/// Run `fut` with a deadline, mapping expiry to [`ClusterError::Timeout`]
pub async fn with_deadline<T, F>(deadline: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Timeout(format!("{} after {:?}", op, deadline))),
    }
}
