//! Local cache store
//!
//! Every node keeps its own copy of configuration entities, binlog positions
//! and run-state in an embedded redb database. In standalone mode it is the
//! system of record; in cluster mode it is a cache reconciled against the
//! remote store.
//!
//! # Example
//!
//! ```ignore
//! use binrelay_cluster::storage::{Bucket, LocalStore};
//!
//! let store = LocalStore::open("/data/binrelay.redb")?;
//! store.put(Bucket::Source, 42, b"{}")?;
//! ```

mod local;

pub use local::{Bucket, LocalStore, LocalTxn};
