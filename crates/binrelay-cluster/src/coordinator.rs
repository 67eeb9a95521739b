//! Cluster coordinator - owns every cluster component of a node
//!
//! The ClusterCoordinator is the main entry point. It:
//! - opens the local cache store
//! - connects (or accepts) the remote metadata and run-state backends
//! - allocates this node's machine index and id generator
//! - builds the metadata repositories and the run-state store
//! - runs leader election and background reconciliation

use crate::config::{ClusterConfig, ClusterMode, MetadataBackendKind};
use crate::election::{
    ElectionDriver, ElectionEvent, ElectionService, ElectionState, ElectionTiming, LeaseClient,
};
use crate::error::{ClusterError, Result};
use crate::id::IdGenerator;
use crate::keys::{self, KeyPaths};
use crate::metadata::MetadataRepository;
use crate::model::{EndpointInfo, PipelineInfo, SourceInfo};
use crate::reconcile::{Reconciler, Repositories};
use crate::remote::{with_deadline, MetadataBackend, StateBackend, TreeBackend, TreeClient};
use crate::state::RunStateStore;
use crate::storage::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Machine index of a standalone node
pub const STANDALONE_MACHINE_INDEX: u16 = 1;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Built, background tasks not running
    Starting,
    /// Election and reconciliation running
    Running,
    /// Shutting down gracefully
    Leaving,
    /// Shutdown complete
    Stopped,
}

/// Point-in-time view of a node
#[derive(Debug, Clone)]
pub struct ClusterHealth {
    pub state: CoordinatorState,
    pub election: ElectionState,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub machine_index: u16,
    pub pending_intents: usize,
}

/// Remote handles a coordinator can be given instead of connecting itself
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: ClusterConfig,
    tree: Option<Arc<dyn TreeClient>>,
    lease: Option<Arc<dyn LeaseClient>>,
    metadata: Option<Arc<dyn MetadataBackend>>,
    state: Option<Arc<dyn StateBackend>>,
}

impl CoordinatorBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Tree service session (zookeeper mode)
    pub fn tree_client(mut self, client: Arc<dyn TreeClient>) -> Self {
        self.tree = Some(client);
        self
    }

    /// Lease service client (etcd mode)
    pub fn lease_client(mut self, client: Arc<dyn LeaseClient>) -> Self {
        self.lease = Some(client);
        self
    }

    /// Relational metadata and run-state backend (`metadata_backend = mysql`)
    pub fn relational_backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: MetadataBackend + StateBackend + 'static,
    {
        self.metadata = Some(backend.clone());
        self.state = Some(backend);
        self
    }

    pub async fn build(self) -> Result<ClusterCoordinator> {
        ClusterCoordinator::assemble(self).await
    }
}

/// Everything a node needs to serve as leader or follower
pub struct ClusterCoordinator {
    config: ClusterConfig,
    keys: KeyPaths,
    local: LocalStore,
    remote: Option<Arc<dyn MetadataBackend>>,
    ids: IdGenerator,
    repositories: Repositories,
    run_state: RunStateStore,
    election: Arc<ElectionService>,
    state: RwLock<CoordinatorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ClusterCoordinator {
    /// Build a coordinator, connecting to the backends named by `config`
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        CoordinatorBuilder::new(config).build().await
    }

    /// Standalone coordinator (no clustering)
    pub async fn standalone(config: ClusterConfig) -> Result<Self> {
        let config = ClusterConfig {
            mode: ClusterMode::Standalone,
            ..config
        };
        Self::new(config).await
    }

    pub fn builder(config: ClusterConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    async fn assemble(builder: CoordinatorBuilder) -> Result<Self> {
        let CoordinatorBuilder {
            config,
            tree,
            lease,
            metadata,
            state,
        } = builder;
        config.validate()?;

        let keys = KeyPaths::new(&config.name);
        let local = LocalStore::open(config.store_path())?;
        let timing = ElectionTiming {
            retry_interval: config.election_retry_interval,
            call_timeout: config.remote_timeout,
        };

        let (remote, state_backend, driver) = match config.mode {
            ClusterMode::Standalone => (None, None, ElectionDriver::Standalone),
            ClusterMode::Zookeeper => {
                let client = match tree {
                    Some(client) => client,
                    None => connect_tree(&config).await?,
                };
                // the election node hangs off the root whichever store holds metadata
                with_deadline(
                    config.remote_timeout,
                    "ensure_path",
                    client.ensure_path(keys.root()),
                )
                .await?;
                let (remote, state_backend) = match config.metadata_backend {
                    MetadataBackendKind::Coordinator => {
                        let backend = Arc::new(TreeBackend::new(
                            client.clone(),
                            keys.clone(),
                            config.remote_timeout,
                        ));
                        let remote: Arc<dyn MetadataBackend> = backend.clone();
                        let state: Arc<dyn StateBackend> = backend;
                        (remote, state)
                    }
                    MetadataBackendKind::Mysql => relational(&config, metadata, state)?,
                };
                let driver = ElectionDriver::Tree {
                    client,
                    path: keys.election(),
                };
                (Some(remote), Some(state_backend), driver)
            }
            ClusterMode::Etcd => {
                let client = match lease {
                    Some(client) => client,
                    None => connect_lease(&config).await?,
                };
                let (remote, state_backend) = relational(&config, metadata, state)?;
                let driver = ElectionDriver::Lease {
                    client,
                    election: keys::join([keys.root(), config.etcd.election_key.as_str()]),
                    elected: keys.elected(),
                    ttl: config.etcd.lease_ttl,
                };
                (Some(remote), Some(state_backend), driver)
            }
        };

        let machine_index = match &state_backend {
            Some(backend) => {
                backend.bootstrap().await?;
                if let Some(remote) = &remote {
                    remote.bootstrap().await?;
                }
                backend.machine_index(&config.node_id).await?
            }
            None => STANDALONE_MACHINE_INDEX,
        };
        let ids = IdGenerator::new(machine_index)?;

        let repositories = Repositories {
            sources: MetadataRepository::<SourceInfo>::new(local.clone(), remote.clone()),
            endpoints: MetadataRepository::<EndpointInfo>::new(local.clone(), remote.clone()),
            pipelines: MetadataRepository::<PipelineInfo>::new(local.clone(), remote.clone()),
        };
        let run_state = match state_backend {
            Some(backend) => RunStateStore::remote(backend),
            None => RunStateStore::local(local.clone()),
        };
        let election = Arc::new(ElectionService::new(config.node_id.clone(), driver, timing));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            node_id = %config.node_id,
            mode = ?config.mode,
            backend = remote.as_ref().map(|r| r.name()).unwrap_or("local"),
            machine_index,
            "Cluster coordinator ready"
        );

        Ok(Self {
            config,
            keys,
            local,
            remote,
            ids,
            repositories,
            run_state,
            election,
            state: RwLock::new(CoordinatorState::Starting),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Join the election and start reconciling; idempotent
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                CoordinatorState::Starting => *state = CoordinatorState::Running,
                CoordinatorState::Running => return Ok(()),
                CoordinatorState::Leaving | CoordinatorState::Stopped => {
                    return Err(ClusterError::ShuttingDown)
                }
            }
        }

        self.election.elect()?;

        if let Some(remote) = &self.remote {
            // catch up before serving reads
            for (kind, result) in self.repositories.refresh_all().await {
                if let Err(e) = result {
                    warn!(%kind, error = %e, "Initial metadata refresh failed");
                }
            }

            let reconciler = Reconciler::new(
                self.repositories.clone(),
                remote.clone(),
                self.election.clone(),
                self.config.reconcile_interval,
            );
            self.tasks
                .lock()
                .push(reconciler.spawn(self.shutdown_tx.subscribe()));
        }

        info!(node_id = %self.config.node_id, "Cluster coordinator started");
        Ok(())
    }

    /// Leave the election and stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, CoordinatorState::Leaving | CoordinatorState::Stopped) {
                return Ok(());
            }
            *state = CoordinatorState::Leaving;
        }

        let _ = self.shutdown_tx.send(());
        self.election.resign().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        *self.state.write() = CoordinatorState::Stopped;
        info!(node_id = %self.config.node_id, "Coordinator shutdown complete");
        Ok(())
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn keys(&self) -> &KeyPaths {
        &self.keys
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn machine_index(&self) -> u16 {
        self.ids.machine()
    }

    /// Allocate a new entity id
    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    pub fn sources(&self) -> &MetadataRepository<SourceInfo> {
        &self.repositories.sources
    }

    pub fn endpoints(&self) -> &MetadataRepository<EndpointInfo> {
        &self.repositories.endpoints
    }

    pub fn pipelines(&self) -> &MetadataRepository<PipelineInfo> {
        &self.repositories.pipelines
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn run_state(&self) -> &RunStateStore {
        &self.run_state
    }

    pub fn election(&self) -> &Arc<ElectionService> {
        &self.election
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.election.leader()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.election.subscribe()
    }

    /// Fail with `NotLeader` unless this node may write
    pub fn ensure_leader(&self) -> Result<()> {
        self.election.ensure_leader()
    }

    // ==================== Operations ====================

    /// Delete a pipeline with its rules, run-state and position
    pub async fn delete_pipeline(&self, pipeline_id: u64) -> Result<()> {
        self.ensure_leader()?;
        self.repositories.pipelines.cascade_delete(pipeline_id).await?;
        self.run_state.remove(pipeline_id).await?;
        info!(pipeline = pipeline_id, "Deleted pipeline");
        Ok(())
    }

    pub fn health(&self) -> ClusterHealth {
        ClusterHealth {
            state: self.coordinator_state(),
            election: self.election.state(),
            is_leader: self.is_leader(),
            leader: self.leader(),
            machine_index: self.machine_index(),
            pending_intents: self.repositories.sources.intents().len().unwrap_or(0),
        }
    }
}

impl Drop for ClusterCoordinator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn relational(
    config: &ClusterConfig,
    metadata: Option<Arc<dyn MetadataBackend>>,
    state: Option<Arc<dyn StateBackend>>,
) -> Result<(Arc<dyn MetadataBackend>, Arc<dyn StateBackend>)> {
    if let (Some(metadata), Some(state)) = (metadata, state) {
        return Ok((metadata, state));
    }
    connect_mysql(config)
}

#[cfg(feature = "mysql")]
fn connect_mysql(
    config: &ClusterConfig,
) -> Result<(Arc<dyn MetadataBackend>, Arc<dyn StateBackend>)> {
    let backend = Arc::new(crate::remote::MySqlBackend::connect(
        &config.mysql.url,
        config.remote_timeout,
    )?);
    let metadata: Arc<dyn MetadataBackend> = backend.clone();
    let state: Arc<dyn StateBackend> = backend;
    Ok((metadata, state))
}

#[cfg(not(feature = "mysql"))]
fn connect_mysql(
    _config: &ClusterConfig,
) -> Result<(Arc<dyn MetadataBackend>, Arc<dyn StateBackend>)> {
    Err(ClusterError::BackendUnavailable("mysql"))
}

#[cfg(feature = "zookeeper")]
async fn connect_tree(config: &ClusterConfig) -> Result<Arc<dyn TreeClient>> {
    let client = crate::remote::ZookeeperTree::connect(&config.zookeeper).await?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "zookeeper"))]
async fn connect_tree(_config: &ClusterConfig) -> Result<Arc<dyn TreeClient>> {
    Err(ClusterError::BackendUnavailable("zookeeper"))
}

#[cfg(feature = "etcd")]
async fn connect_lease(config: &ClusterConfig) -> Result<Arc<dyn LeaseClient>> {
    let client = crate::election::EtcdLeaseClient::connect(&config.etcd).await?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "etcd"))]
async fn connect_lease(_config: &ClusterConfig) -> Result<Arc<dyn LeaseClient>> {
    Err(ClusterError::BackendUnavailable("etcd"))
}
