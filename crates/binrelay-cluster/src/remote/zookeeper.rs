//! ZooKeeper adapter for [`TreeClient`]
//!
//! A ZooKeeper session cannot be revived once expired, so the adapter keeps
//! the current `zk::Client` behind a lock and a supervisor task replaces it
//! with a fresh connection after expiry. Every replacement bumps the session
//! id published through [`TreeClient::session`].

use super::tree::{
    CreateMode, SessionInfo, SessionState, TreeClient, TreeEvent, TreeEventKind,
};
use crate::config::ZookeeperConfig;
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use zookeeper_client as zk;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn map_err(e: zk::Error, path: &str, expected: Option<i32>) -> ClusterError {
    match e {
        zk::Error::NoNode => ClusterError::NotFound(path.to_string()),
        zk::Error::NodeExists => ClusterError::AlreadyExists(path.to_string()),
        zk::Error::BadVersion => ClusterError::VersionConflict {
            key: path.to_string(),
            expected: expected.unwrap_or(-1),
        },
        zk::Error::SessionExpired => ClusterError::SessionExpired,
        zk::Error::ConnectionLoss => ClusterError::Unavailable(e.to_string()),
        other => ClusterError::Backend(other.to_string()),
    }
}

fn session_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
            SessionState::Connected
        }
        zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed => {
            SessionState::Expired
        }
        _ => SessionState::Disconnected,
    }
}

struct Shared {
    client: RwLock<zk::Client>,
    session: watch::Sender<SessionInfo>,
}

/// Tree client backed by a ZooKeeper ensemble
pub struct ZookeeperTree {
    shared: Arc<Shared>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl ZookeeperTree {
    /// Connect to the ensemble and start the session supervisor
    pub async fn connect(config: &ZookeeperConfig) -> Result<Self> {
        let cluster = config.connect_string();
        let client = Self::open(&cluster, config.session_timeout).await?;
        info!(%cluster, "Connected to ZooKeeper");

        let (session, _) = watch::channel(SessionInfo {
            id: 1,
            state: SessionState::Connected,
        });
        let shared = Arc::new(Shared {
            client: RwLock::new(client),
            session,
        });

        let supervisor = tokio::spawn(Self::supervise(
            shared.clone(),
            cluster,
            config.session_timeout,
        ));

        Ok(Self { shared, supervisor })
    }

    async fn open(cluster: &str, timeout: Duration) -> Result<zk::Client> {
        match tokio::time::timeout(timeout, zk::Client::connect(cluster)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(ClusterError::Unavailable(format!("zookeeper connect: {}", e))),
            Err(_) => Err(ClusterError::Timeout(format!(
                "zookeeper connect after {:?}",
                timeout
            ))),
        }
    }

    async fn supervise(shared: Arc<Shared>, cluster: String, timeout: Duration) {
        loop {
            let mut states = shared.client.read().state_watcher();
            loop {
                let state = session_state(states.changed().await);
                shared.session.send_modify(|info| info.state = state);
                if state == SessionState::Expired {
                    break;
                }
            }

            warn!(%cluster, "ZooKeeper session expired, reconnecting");
            let client = loop {
                match Self::open(&cluster, timeout).await {
                    Ok(client) => break client,
                    Err(e) => {
                        debug!(error = %e, "ZooKeeper reconnect failed");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            };

            *shared.client.write() = client;
            shared.session.send_modify(|info| {
                info.id += 1;
                info.state = SessionState::Connected;
            });
            info!(%cluster, "ZooKeeper session re-established");
        }
    }

    fn client(&self) -> zk::Client {
        self.shared.client.read().clone()
    }
}

impl Drop for ZookeeperTree {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl TreeClient for ZookeeperTree {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        let mode = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent,
            CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        self.client()
            .create(path, data, &options)
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, path, None))
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        let (data, stat) = self
            .client()
            .get_data(path)
            .await
            .map_err(|e| map_err(e, path, None))?;
        Ok((data, stat.version))
    }

    async fn set(&self, path: &str, data: &[u8], expected: Option<i32>) -> Result<i32> {
        let stat = self
            .client()
            .set_data(path, data, expected)
            .await
            .map_err(|e| map_err(e, path, expected))?;
        Ok(stat.version)
    }

    async fn delete(&self, path: &str, expected: Option<i32>) -> Result<()> {
        self.client()
            .delete(path, expected)
            .await
            .map_err(|e| map_err(e, path, expected))
    }

    async fn exists(&self, path: &str) -> Result<Option<i32>> {
        let stat = self
            .client()
            .check_stat(path)
            .await
            .map_err(|e| map_err(e, path, None))?;
        Ok(stat.map(|s| s.version))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.client()
            .list_children(path)
            .await
            .map_err(|e| map_err(e, path, None))
    }

    async fn watch_deletion(&self, path: &str) -> Result<Option<oneshot::Receiver<()>>> {
        let client = self.client();
        let (stat, watcher) = client
            .check_and_watch_stat(path)
            .await
            .map_err(|e| map_err(e, path, None))?;
        if stat.is_none() {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let path = path.to_string();
        tokio::spawn(async move {
            let mut watcher = watcher;
            loop {
                let event = watcher.changed().await;
                match event.event_type {
                    zk::EventType::NodeDataChanged => {
                        // data watches are one-shot; re-arm and keep waiting
                        match client.check_and_watch_stat(&path).await {
                            Ok((Some(_), next)) => watcher = next,
                            _ => break,
                        }
                    }
                    _ => break,
                }
            }
            let _ = tx.send(());
        });
        Ok(Some(rx))
    }

    async fn watch_tree(&self, path: &str) -> Result<mpsc::UnboundedReceiver<TreeEvent>> {
        let mut watcher = self
            .client()
            .watch(path, zk::AddWatchMode::PersistentRecursive)
            .await
            .map_err(|e| map_err(e, path, None))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = watcher.changed().await;
                let kind = match event.event_type {
                    zk::EventType::NodeCreated => TreeEventKind::Created,
                    zk::EventType::NodeDataChanged => TreeEventKind::DataChanged,
                    zk::EventType::NodeDeleted => TreeEventKind::Deleted,
                    zk::EventType::Session => {
                        if session_state(event.session_state) == SessionState::Expired {
                            break;
                        }
                        continue;
                    }
                    _ => continue,
                };
                if tx
                    .send(TreeEvent {
                        path: event.path,
                        kind,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn session(&self) -> watch::Receiver<SessionInfo> {
        self.shared.session.subscribe()
    }
}
