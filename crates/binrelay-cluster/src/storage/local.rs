//! redb-backed local cache store

use crate::error::{ClusterError, Result};
use crate::model::MetadataKind;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SOURCE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("source");
const ENDPOINT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("endpoint");
const PIPELINE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("pipeline");
const RULE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("rule");
const POSITION_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("position");
const STATE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("state");
const INTENT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("intent");

/// Named key space inside the local store, keyed by u64 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Source,
    Endpoint,
    Pipeline,
    Rule,
    Position,
    State,
    /// Cascade writes not yet acknowledged by the remote store
    Intent,
}

impl Bucket {
    pub const ALL: [Bucket; 7] = [
        Bucket::Source,
        Bucket::Endpoint,
        Bucket::Pipeline,
        Bucket::Rule,
        Bucket::Position,
        Bucket::State,
        Bucket::Intent,
    ];

    fn table(self) -> TableDefinition<'static, u64, &'static [u8]> {
        match self {
            Bucket::Source => SOURCE_TABLE,
            Bucket::Endpoint => ENDPOINT_TABLE,
            Bucket::Pipeline => PIPELINE_TABLE,
            Bucket::Rule => RULE_TABLE,
            Bucket::Position => POSITION_TABLE,
            Bucket::State => STATE_TABLE,
            Bucket::Intent => INTENT_TABLE,
        }
    }
}

impl From<MetadataKind> for Bucket {
    fn from(kind: MetadataKind) -> Self {
        match kind {
            MetadataKind::Source => Bucket::Source,
            MetadataKind::Endpoint => Bucket::Endpoint,
            MetadataKind::Pipeline => Bucket::Pipeline,
            MetadataKind::Rule => Bucket::Rule,
        }
    }
}

/// Embedded transactional store shared by every repository of a node
///
/// Cloning is cheap; clones share the same database handle and redb
/// serialises writers internally.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or create) the store at `path`, creating every bucket
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ClusterError::Storage(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        for bucket in Bucket::ALL {
            write_txn.open_table(bucket.table())?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "Opened local store");

        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, bucket: Bucket, id: u64) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(bucket.table())?;
        let value = table.get(id)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn put(&self, bucket: Bucket, id: u64, value: &[u8]) -> Result<()> {
        self.write(|txn| txn.put(bucket, id, value))
    }

    /// Remove `id`, returning whether it was present
    pub fn delete(&self, bucket: Bucket, id: u64) -> Result<bool> {
        self.write(|txn| txn.delete(bucket, id))
    }

    /// Every entry of a bucket in ascending id order
    pub fn scan_all(&self, bucket: Bucket) -> Result<Vec<(u64, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(bucket.table())?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            entries.push((key.value(), value.value().to_vec()));
        }
        Ok(entries)
    }

    pub fn get_json<T: DeserializeOwned>(&self, bucket: Bucket, id: u64) -> Result<Option<T>> {
        self.get(bucket, id)?
            .map(|bytes| crate::codec::decode(&bytes))
            .transpose()
    }

    pub fn put_json<T: Serialize>(&self, bucket: Bucket, id: u64, value: &T) -> Result<()> {
        let bytes = crate::codec::encode(value)?;
        self.put(bucket, id, &bytes)
    }

    /// Run `f` inside one write transaction
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted otherwise,
    /// so either every write made through the [`LocalTxn`] lands or none does.
    pub fn write<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LocalTxn) -> Result<R>,
    {
        let txn = LocalTxn {
            inner: self.db.begin_write()?,
        };
        match f(&txn) {
            Ok(result) => {
                txn.inner.commit()?;
                Ok(result)
            }
            Err(e) => {
                txn.inner.abort()?;
                Err(e)
            }
        }
    }
}

/// Handle to an open write transaction
pub struct LocalTxn {
    inner: WriteTransaction,
}

impl LocalTxn {
    pub fn get(&self, bucket: Bucket, id: u64) -> Result<Option<Vec<u8>>> {
        let table = self.inner.open_table(bucket.table())?;
        let value = table.get(id)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn put(&self, bucket: Bucket, id: u64, value: &[u8]) -> Result<()> {
        let mut table = self.inner.open_table(bucket.table())?;
        table.insert(id, value)?;
        Ok(())
    }

    pub fn delete(&self, bucket: Bucket, id: u64) -> Result<bool> {
        let mut table = self.inner.open_table(bucket.table())?;
        let removed = table.remove(id)?.is_some();
        Ok(removed)
    }

    pub fn scan_all(&self, bucket: Bucket) -> Result<Vec<(u64, Vec<u8>)>> {
        let table = self.inner.open_table(bucket.table())?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            entries.push((key.value(), value.value().to_vec()));
        }
        Ok(entries)
    }

    pub fn get_json<T: DeserializeOwned>(&self, bucket: Bucket, id: u64) -> Result<Option<T>> {
        self.get(bucket, id)?
            .map(|bytes| crate::codec::decode(&bytes))
            .transpose()
    }

    pub fn put_json<T: Serialize>(&self, bucket: Bucket, id: u64, value: &T) -> Result<()> {
        let bytes = crate::codec::encode(value)?;
        self.put(bucket, id, &bytes)
    }
}
