//! # binrelay cluster
//!
//! Cluster coordination and replicated configuration metadata for the
//! binrelay CDC relay:
//! - **Leader election**: exactly one active node, delegated to a tree
//!   service (ephemeral node) or a lease service (campaign)
//! - **Replicated metadata**: sources, endpoints and pipelines cached
//!   locally and versioned optimistically in a remote store
//! - **Run-state**: pipeline status and binlog positions for failover resume
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ClusterCoordinator                       │
//! ├───────────────┬──────────────────────┬───────────────────────┤
//! │   Election    │  Metadata repository │    Run-state store    │
//! │ • tree / lease│ • cascade writes     │ • pipeline state      │
//! │ • events      │ • reconciliation     │ • binlog position     │
//! ├───────────────┴──────────┬───────────┴───────────────────────┤
//! │  Local cache (redb)      │  Remote store (tree | relational) │
//! └──────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! ## Deployment Modes
//!
//! - **Standalone**: single node, the local cache is authoritative
//! - **Zookeeper**: tree-service election; metadata in the tree or in MySQL
//! - **Etcd**: lease election; metadata in MySQL
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use binrelay_cluster::{ClusterConfig, ClusterCoordinator, SourceInfo};
//!
//! let coordinator = ClusterCoordinator::standalone(ClusterConfig::standalone()).await?;
//! coordinator.start().await?;
//!
//! let mut source = SourceInfo::new(coordinator.next_id(), "orders", "db1", 3306);
//! coordinator.sources().cascade_insert(&mut source).await?;
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod id;
pub mod keys;
pub mod metadata;
pub mod model;
pub mod observability;
pub mod reconcile;
pub mod remote;
pub mod state;
pub mod storage;

// Re-export main types
pub use config::{
    ClusterConfig, ClusterConfigBuilder, ClusterMode, EtcdConfig, MetadataBackendKind,
    MysqlConfig, ZookeeperConfig,
};
pub use coordinator::{ClusterCoordinator, ClusterHealth, CoordinatorBuilder, CoordinatorState};
pub use election::{
    ElectionDriver, ElectionEvent, ElectionService, ElectionState, ElectionTiming, LeaseClient,
    MemoryLeaseService,
};
pub use error::{ClusterError, Result};
pub use id::IdGenerator;
pub use keys::KeyPaths;
pub use metadata::{
    IntentLog, ListFilter, MetadataRepository, RefreshOutcome, RefreshReport, ReplayReport,
};
pub use model::{
    EndpointInfo, EndpointType, Entity, EntityStatus, MetadataKind, MetadataVersion,
    PipelineInfo, PipelineState, PipelineStatus, Position, SourceInfo, TransformRule,
};
pub use observability::{init_metrics, ElectionMetrics, MetadataMetrics, RunStateMetrics};
pub use reconcile::{Reconciler, Repositories};
pub use remote::{
    MemoryTree, MemoryTreeClient, MetadataBackend, MetadataChange, StateBackend, TreeBackend,
    TreeClient,
};
pub use state::RunStateStore;
pub use storage::{Bucket, LocalStore};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{ClusterConfig, ClusterMode};
    pub use crate::coordinator::ClusterCoordinator;
    pub use crate::election::{ElectionEvent, ElectionService};
    pub use crate::error::{ClusterError, Result};
    pub use crate::metadata::{ListFilter, MetadataRepository};
    pub use crate::model::{
        EndpointInfo, Entity, PipelineInfo, PipelineState, PipelineStatus, Position, SourceInfo,
    };
}
