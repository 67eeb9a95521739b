//! Tree coordination service backend
//!
//! [`TreeClient`] is the narrow slice of a ZooKeeper-style service the cluster
//! needs: versioned znodes, ephemeral nodes bound to a session, deletion
//! watches and recursive change notifications. [`TreeBackend`] maps the
//! metadata and run-state contracts onto it.

use super::{with_deadline, MetadataBackend, MetadataChange, StateBackend};
use crate::codec;
use crate::error::{ClusterError, Result};
use crate::id::MAX_MACHINE_INDEX;
use crate::keys::KeyPaths;
use crate::model::{MetadataKind, MetadataVersion, PipelineState, Position};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const MACHINE_ALLOC_ATTEMPTS: usize = 8;

/// Node lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// Current session of a client
///
/// `id` changes whenever the client re-establishes a session after expiry;
/// ephemeral nodes created under an older id are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub state: SessionState,
}

impl SessionInfo {
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEventKind {
    Created,
    DataChanged,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEvent {
    pub path: String,
    pub kind: TreeEventKind,
}

/// Client of a hierarchical coordination service
///
/// Versions are the service's native modification counters (0 after create).
/// Implementations report a missing node as `NotFound`, an existing node as
/// `AlreadyExists` and a failed version check as `VersionConflict`.
#[async_trait]
pub trait TreeClient: Send + Sync {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32)>;

    /// Replace data, optionally only if the native version matches
    async fn set(&self, path: &str, data: &[u8], expected: Option<i32>) -> Result<i32>;

    async fn delete(&self, path: &str, expected: Option<i32>) -> Result<()>;

    /// Native version if the node exists
    async fn exists(&self, path: &str) -> Result<Option<i32>>;

    /// Child names (not full paths)
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// One-shot notification fired when `path` is deleted. `None` means the
    /// node is already absent.
    async fn watch_deletion(&self, path: &str) -> Result<Option<oneshot::Receiver<()>>>;

    /// Stream of every change at or below `path`
    async fn watch_tree(&self, path: &str) -> Result<mpsc::UnboundedReceiver<TreeEvent>>;

    fn session(&self) -> watch::Receiver<SessionInfo>;

    /// Create every missing persistent node along `path`
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.create(&current, &[], CreateMode::Persistent).await {
                Ok(()) | Err(ClusterError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Metadata and run-state stored in a tree service
pub struct TreeBackend {
    client: Arc<dyn TreeClient>,
    keys: KeyPaths,
    timeout: Duration,
}

impl TreeBackend {
    pub fn new(client: Arc<dyn TreeClient>, keys: KeyPaths, timeout: Duration) -> Self {
        Self {
            client,
            keys,
            timeout,
        }
    }

    pub fn client(&self) -> &Arc<dyn TreeClient> {
        &self.client
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match with_deadline(self.timeout, "get", self.client.get(path)).await {
            Ok((data, _)) => Ok(Some(codec::decode(&data)?)),
            Err(ClusterError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let version = with_deadline(self.timeout, "exists", self.client.exists(path)).await?;
        Ok(version.is_some())
    }

    async fn create_json<T: serde::Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let data = codec::encode(value)?;
        with_deadline(
            self.timeout,
            "create",
            self.client.create(path, &data, CreateMode::Persistent),
        )
        .await
    }

    async fn set_json<T: serde::Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let data = codec::encode(value)?;
        with_deadline(self.timeout, "set", self.client.set(path, &data, None)).await?;
        Ok(())
    }

    async fn delete_if_present(&self, path: &str) -> Result<()> {
        match with_deadline(self.timeout, "delete", self.client.delete(path, None)).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every `(node, index)` pair recorded under the machine parent
    async fn machine_indices(&self) -> Result<Vec<(String, u16)>> {
        let parent = self.keys.machine_parent();
        let children =
            with_deadline(self.timeout, "children", self.client.children(&parent)).await?;

        let mut indices = Vec::with_capacity(children.len());
        for child in children {
            let node = self.keys.machine_node(&child);
            let path = self.keys.machine(&node);
            match with_deadline(self.timeout, "get", self.client.get(&path)).await {
                Ok((data, _)) => indices.push((node, parse_index(&data)?)),
                Err(ClusterError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(indices)
    }

    fn first_other_holder(indices: &[(String, u16)], node: &str, index: u16) -> Option<String> {
        indices
            .iter()
            .filter(|(holder, i)| *i == index && holder != node)
            .map(|(holder, _)| holder.clone())
            .min()
    }
}

fn parse_index(data: &[u8]) -> Result<u16> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| ClusterError::Serialization("invalid machine index payload".into()))
}

#[async_trait]
impl MetadataBackend for TreeBackend {
    fn name(&self) -> &'static str {
        "tree"
    }

    async fn bootstrap(&self) -> Result<()> {
        for parent in self.keys.persistent_parents() {
            with_deadline(self.timeout, "ensure_path", self.client.ensure_path(&parent)).await?;
        }
        debug!(root = %self.keys.root(), "Tree parents ensured");
        Ok(())
    }

    async fn insert(&self, kind: MetadataKind, id: u64, payload: &[u8]) -> Result<()> {
        let path = self.keys.metadata_item(kind, id);
        let data = codec::compress(payload)?;
        with_deadline(
            self.timeout,
            "create",
            self.client.create(&path, &data, CreateMode::Persistent),
        )
        .await
    }

    async fn delete(&self, kind: MetadataKind, id: u64) -> Result<()> {
        self.delete_if_present(&self.keys.metadata_item(kind, id))
            .await
    }

    async fn update(
        &self,
        kind: MetadataKind,
        id: u64,
        expected: i32,
        payload: &[u8],
    ) -> Result<i32> {
        let path = self.keys.metadata_item(kind, id);
        if expected < 1 {
            return Err(ClusterError::VersionConflict {
                key: path,
                expected,
            });
        }

        let data = codec::compress(payload)?;
        match with_deadline(
            self.timeout,
            "set",
            self.client.set(&path, &data, Some(expected - 1)),
        )
        .await
        {
            Ok(native) => Ok(native + 1),
            Err(ClusterError::VersionConflict { .. }) => {
                Err(ClusterError::VersionConflict { key: path, expected })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_version(&self, kind: MetadataKind, id: u64) -> Result<i32> {
        let path = self.keys.metadata_item(kind, id);
        match with_deadline(self.timeout, "exists", self.client.exists(&path)).await? {
            Some(native) => Ok(native + 1),
            None => Err(ClusterError::entity_not_found(kind, id)),
        }
    }

    async fn get(&self, kind: MetadataKind, id: u64) -> Result<(Vec<u8>, i32)> {
        let path = self.keys.metadata_item(kind, id);
        match with_deadline(self.timeout, "get", self.client.get(&path)).await {
            Ok((data, native)) => Ok((codec::decompress(&data)?, native + 1)),
            Err(ClusterError::NotFound(_)) => Err(ClusterError::entity_not_found(kind, id)),
            Err(e) => Err(e),
        }
    }

    async fn list_versions(&self, kind: MetadataKind) -> Result<Vec<MetadataVersion>> {
        let parent = self.keys.metadata_parent(kind);
        let children =
            with_deadline(self.timeout, "children", self.client.children(&parent)).await?;

        let mut versions = Vec::with_capacity(children.len());
        for child in children {
            let Ok(id) = child.parse::<u64>() else {
                warn!(%parent, %child, "Ignoring non-numeric metadata node");
                continue;
            };
            match self.get_version(kind, id).await {
                Ok(version) => versions.push(MetadataVersion { id, version }),
                // removed between listing and reading
                Err(ClusterError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        versions.sort_by_key(|v| v.id);
        Ok(versions)
    }

    async fn watch_changes(&self) -> Result<Option<mpsc::UnboundedReceiver<MetadataChange>>> {
        let root = self.keys.metadata_root();
        let mut events =
            with_deadline(self.timeout, "watch", self.client.watch_tree(&root)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let keys = self.keys.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some((kind, id)) = keys.parse_metadata_item(&event.path) else {
                    continue;
                };
                if tx.send(MetadataChange { kind, id }).is_err() {
                    break;
                }
            }
        });

        Ok(Some(rx))
    }
}

#[async_trait]
impl StateBackend for TreeBackend {
    async fn bootstrap(&self) -> Result<()> {
        MetadataBackend::bootstrap(self).await
    }

    async fn machine_index(&self, node: &str) -> Result<u16> {
        let path = self.keys.machine(node);

        for _ in 0..MACHINE_ALLOC_ATTEMPTS {
            match with_deadline(self.timeout, "get", self.client.get(&path)).await {
                Ok((data, _)) => {
                    let index = parse_index(&data)?;
                    let indices = self.machine_indices().await?;
                    if let Some(holder) = Self::first_other_holder(&indices, node, index) {
                        return Err(ClusterError::DuplicateMachineIndex {
                            index,
                            node: node.to_string(),
                            holder,
                        });
                    }
                    return Ok(index);
                }
                Err(ClusterError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            let indices = self.machine_indices().await?;
            let next = indices.iter().map(|(_, i)| *i).max().unwrap_or(0) + 1;
            if next > MAX_MACHINE_INDEX {
                return Err(ClusterError::InvalidConfig(format!(
                    "machine indices exhausted ({} nodes registered)",
                    indices.len()
                )));
            }

            match with_deadline(
                self.timeout,
                "create",
                self.client
                    .create(&path, next.to_string().as_bytes(), CreateMode::Persistent),
            )
            .await
            {
                Ok(()) => {}
                Err(ClusterError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }

            // Two fresh nodes may have picked the same index concurrently.
            // The lexicographically smaller identity keeps it.
            let indices = self.machine_indices().await?;
            match Self::first_other_holder(&indices, node, next) {
                Some(holder) if holder.as_str() < node => {
                    debug!(node, index = next, %holder, "Machine index collision, reallocating");
                    self.delete_if_present(&path).await?;
                    continue;
                }
                _ => {
                    info!(node, index = next, "Allocated machine index");
                    return Ok(next);
                }
            }
        }

        Err(ClusterError::TooManyRetries(format!(
            "machine index allocation for {}",
            node
        )))
    }

    async fn position_exists(&self, pipeline_id: u64) -> Result<bool> {
        self.exists(&self.keys.position(pipeline_id)).await
    }

    async fn create_position(&self, pipeline_id: u64, position: &Position) -> Result<()> {
        self.create_json(&self.keys.position(pipeline_id), position)
            .await
    }

    async fn update_position(&self, pipeline_id: u64, position: &Position) -> Result<()> {
        self.set_json(&self.keys.position(pipeline_id), position)
            .await
    }

    async fn get_position(&self, pipeline_id: u64) -> Result<Option<Position>> {
        self.read_json(&self.keys.position(pipeline_id)).await
    }

    async fn state_exists(&self, pipeline_id: u64) -> Result<bool> {
        self.exists(&self.keys.state(pipeline_id)).await
    }

    async fn create_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        self.create_json(&self.keys.state(pipeline_id), state).await
    }

    async fn update_state(&self, pipeline_id: u64, state: &PipelineState) -> Result<()> {
        self.set_json(&self.keys.state(pipeline_id), state).await
    }

    async fn get_state(&self, pipeline_id: u64) -> Result<Option<PipelineState>> {
        self.read_json(&self.keys.state(pipeline_id)).await
    }

    async fn delete_run_state(&self, pipeline_id: u64) -> Result<()> {
        self.delete_if_present(&self.keys.position(pipeline_id))
            .await?;
        self.delete_if_present(&self.keys.state(pipeline_id)).await
    }
}
