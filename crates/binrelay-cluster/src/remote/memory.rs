//! In-process tree coordination service
//!
//! Behaves like a single-server ZooKeeper ensemble: versioned nodes,
//! session-owned ephemeral nodes, deletion watches and recursive change
//! streams. Each [`MemoryTree::connect`] opens an independent session, which
//! makes it possible to run several cluster members in one process, expire
//! their sessions and take the whole service offline.

use super::tree::{
    CreateMode, SessionInfo, SessionState, TreeClient, TreeEvent, TreeEventKind,
};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
}

struct TreeWatch {
    prefix: String,
    tx: mpsc::UnboundedSender<TreeEvent>,
}

struct Inner {
    nodes: BTreeMap<String, Node>,
    available: bool,
    next_session: u64,
    sessions: HashMap<u64, Arc<watch::Sender<SessionInfo>>>,
    deletion_watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    tree_watches: Vec<TreeWatch>,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(ClusterError::Unavailable("tree service unreachable".into()))
        }
    }

    fn notify(&mut self, path: &str, kind: TreeEventKind) {
        self.tree_watches.retain(|w| {
            if !is_under(path, &w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(TreeEvent {
                    path: path.to_string(),
                    kind,
                })
                .is_ok()
        });
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            if let Some(watchers) = self.deletion_watches.remove(path) {
                for tx in watchers {
                    let _ = tx.send(());
                }
            }
            self.notify(path, TreeEventKind::Deleted);
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn drop_ephemerals(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            self.remove(&path);
        }
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Shared in-memory tree service
#[derive(Clone)]
pub struct MemoryTree {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes: BTreeMap::new(),
                available: true,
                next_session: 1,
                sessions: HashMap::new(),
                deletion_watches: HashMap::new(),
                tree_watches: Vec::new(),
            })),
        }
    }

    /// Open a new client session
    pub fn connect(&self) -> MemoryTreeClient {
        let mut inner = self.inner.lock();
        let id = inner.next_session;
        inner.next_session += 1;

        let state = if inner.available {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        let session = Arc::new(watch::channel(SessionInfo { id, state }).0);
        inner.sessions.insert(id, session.clone());

        MemoryTreeClient {
            tree: self.clone(),
            session,
        }
    }

    /// Simulate a service outage (or recovery)
    ///
    /// While unavailable every call fails with `Unavailable` and sessions
    /// report `Disconnected`. Sessions survive the outage.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock();
        inner.available = available;
        let state = if available {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        for session in inner.sessions.values() {
            session.send_modify(|info| info.state = state);
        }
        debug!(available, "Memory tree availability changed");
    }

    /// Number of nodes currently stored
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One session against a [`MemoryTree`]
pub struct MemoryTreeClient {
    tree: MemoryTree,
    session: Arc<watch::Sender<SessionInfo>>,
}

impl MemoryTreeClient {
    pub fn session_id(&self) -> u64 {
        self.session.borrow().id
    }

    /// Expire the session: its ephemeral nodes are deleted, watchers observe
    /// `Expired`, then the client reconnects under a fresh session id.
    pub fn expire(&self) {
        let mut inner = self.tree.inner.lock();
        let old = self.session.borrow().id;
        inner.drop_ephemerals(old);
        inner.sessions.remove(&old);
        self.session.send_replace(SessionInfo {
            id: old,
            state: SessionState::Expired,
        });

        let id = inner.next_session;
        inner.next_session += 1;
        let state = if inner.available {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        self.session.send_replace(SessionInfo { id, state });
        inner.sessions.insert(id, self.session.clone());
        debug!(old, new = id, "Memory tree session expired");
    }
}

impl Drop for MemoryTreeClient {
    fn drop(&mut self) {
        let mut inner = self.tree.inner.lock();
        let id = self.session.borrow().id;
        inner.drop_ephemerals(id);
        inner.sessions.remove(&id);
    }
}

#[async_trait]
impl TreeClient for MemoryTreeClient {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        let mut inner = self.tree.inner.lock();
        inner.check_available()?;

        if inner.nodes.contains_key(path) {
            return Err(ClusterError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = parent_of(path) {
            match inner.nodes.get(parent) {
                None => return Err(ClusterError::NotFound(parent.to_string())),
                Some(node) if node.ephemeral_owner.is_some() => {
                    return Err(ClusterError::Backend(format!(
                        "ephemeral node {} cannot have children",
                        parent
                    )))
                }
                Some(_) => {}
            }
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.session.borrow().id),
        };
        inner.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral_owner,
            },
        );
        inner.notify(path, TreeEventKind::Created);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        let inner = self.tree.inner.lock();
        inner.check_available()?;
        inner
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.version))
            .ok_or_else(|| ClusterError::NotFound(path.to_string()))
    }

    async fn set(&self, path: &str, data: &[u8], expected: Option<i32>) -> Result<i32> {
        let mut inner = self.tree.inner.lock();
        inner.check_available()?;

        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClusterError::NotFound(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(ClusterError::VersionConflict {
                    key: path.to_string(),
                    expected,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let version = node.version;

        inner.notify(path, TreeEventKind::DataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Option<i32>) -> Result<()> {
        let mut inner = self.tree.inner.lock();
        inner.check_available()?;

        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| ClusterError::NotFound(path.to_string()))?;
        if let Some(expected) = expected {
            if node.version != expected {
                return Err(ClusterError::VersionConflict {
                    key: path.to_string(),
                    expected,
                });
            }
        }
        if inner.has_children(path) {
            return Err(ClusterError::Backend(format!("node {} is not empty", path)));
        }

        inner.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<i32>> {
        let inner = self.tree.inner.lock();
        inner.check_available()?;
        Ok(inner.nodes.get(path).map(|n| n.version))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.tree.inner.lock();
        inner.check_available()?;

        if !inner.nodes.contains_key(path) {
            return Err(ClusterError::NotFound(path.to_string()));
        }
        let prefix = format!("{}/", path);
        Ok(inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn watch_deletion(&self, path: &str) -> Result<Option<oneshot::Receiver<()>>> {
        let mut inner = self.tree.inner.lock();
        inner.check_available()?;

        if !inner.nodes.contains_key(path) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        inner
            .deletion_watches
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(Some(rx))
    }

    async fn watch_tree(&self, path: &str) -> Result<mpsc::UnboundedReceiver<TreeEvent>> {
        let mut inner = self.tree.inner.lock();
        inner.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.tree_watches.push(TreeWatch {
            prefix: path.to_string(),
            tx,
        });
        Ok(rx)
    }

    fn session(&self) -> watch::Receiver<SessionInfo> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let tree = MemoryTree::new();
        let client = tree.connect();

        let err = client
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        client.ensure_path("/a/b").await.unwrap();
        client.ensure_path("/a/b").await.unwrap();
        assert_eq!(client.children("/a").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_versions_and_cas() {
        let tree = MemoryTree::new();
        let client = tree.connect();

        client.create("/n", b"0", CreateMode::Persistent).await.unwrap();
        assert_eq!(client.exists("/n").await.unwrap(), Some(0));
        assert_eq!(client.set("/n", b"1", Some(0)).await.unwrap(), 1);
        assert!(client
            .set("/n", b"x", Some(0))
            .await
            .unwrap_err()
            .is_conflict());
        assert_eq!(client.get("/n").await.unwrap(), (b"1".to_vec(), 1));
    }

    #[tokio::test]
    async fn test_expire_drops_ephemerals_and_fires_watch() {
        let tree = MemoryTree::new();
        let owner = tree.connect();
        let observer = tree.connect();

        owner
            .create("/lock", b"owner", CreateMode::Ephemeral)
            .await
            .unwrap();
        let deleted = observer.watch_deletion("/lock").await.unwrap().unwrap();
        let mut session = owner.session();
        let before = owner.session_id();

        owner.expire();

        deleted.await.unwrap();
        assert!(observer.exists("/lock").await.unwrap().is_none());
        assert_ne!(owner.session_id(), before);
        assert!(session.borrow_and_update().is_connected());
    }

    #[tokio::test]
    async fn test_drop_closes_session() {
        let tree = MemoryTree::new();
        let observer = tree.connect();
        {
            let owner = tree.connect();
            owner
                .create("/lock", b"owner", CreateMode::Ephemeral)
                .await
                .unwrap();
        }
        assert!(observer.exists("/lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage() {
        let tree = MemoryTree::new();
        let client = tree.connect();
        let session = client.session();

        tree.set_available(false);
        assert!(matches!(
            client.exists("/").await,
            Err(ClusterError::Unavailable(_))
        ));
        assert_eq!(session.borrow().state, SessionState::Disconnected);

        tree.set_available(true);
        assert!(session.borrow().is_connected());
    }

    #[tokio::test]
    async fn test_watch_tree_filters_prefix() {
        let tree = MemoryTree::new();
        let client = tree.connect();
        client.ensure_path("/c/metadata").await.unwrap();
        client.ensure_path("/c/state").await.unwrap();

        let mut events = client.watch_tree("/c/metadata").await.unwrap();
        client.create("/c/state/1", b"", CreateMode::Persistent).await.unwrap();
        client
            .create("/c/metadata/1", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "/c/metadata/1");
        assert_eq!(event.kind, TreeEventKind::Created);
    }
}
