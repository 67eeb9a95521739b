//! binrelay daemon (binrelayd)
//!
//! Runs one node of a binrelay relay cluster: joins the leader election,
//! reconciles the replicated configuration metadata into the local cache
//! and keeps the run-state the active relay resumes from.
//!
//! ## Deployment Modes
//!
//! - **Standalone**: single node, zero configuration required
//! - **Zookeeper**: ephemeral-node election, metadata in ZooKeeper or MySQL
//! - **Etcd**: lease election, metadata in MySQL
//!
//! ## Quick Start
//!
//! ```bash
//! # Standalone mode
//! binrelayd
//!
//! # ZooKeeper cluster
//! binrelayd --mode zookeeper --node-id node-1 --zk-addrs zk1:2181,zk2:2181
//! ```

pub mod cli;

pub use cli::{Cli, DeploymentMode, MetadataBackend};
