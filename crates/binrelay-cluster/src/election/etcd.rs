//! etcd adapter for [`LeaseClient`]

use super::lease::LeaseClient;
use crate::config::EtcdConfig;
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

type Keeper = (LeaseKeeper, LeaseKeepAliveStream);

/// Open per-lease handles, reused across refreshes
///
/// A handle is checked out while in use and only returned after a
/// successful refresh, so a broken stream is reopened on the next tick.
struct KeeperCache<T> {
    open: Mutex<HashMap<i64, T>>,
}

impl<T> KeeperCache<T> {
    fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    async fn checkout<F, Fut>(&self, lease: i64, open: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let cached = self.open.lock().remove(&lease);
        match cached {
            Some(handle) => Ok(handle),
            None => open().await,
        }
    }

    fn restore(&self, lease: i64, handle: T) {
        self.open.lock().insert(lease, handle);
    }

    fn forget(&self, lease: i64) {
        self.open.lock().remove(&lease);
    }
}

/// Lease client over the etcd v3 lease, KV and election APIs
#[derive(Clone)]
pub struct EtcdLeaseClient {
    client: Client,
    keepers: Arc<KeeperCache<Keeper>>,
}

impl EtcdLeaseClient {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let options = match (&config.user, &config.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(&config.endpoints, options).await?;
        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self {
            client,
            keepers: Arc::new(KeeperCache::new()),
        })
    }

    async fn open_keeper(&self, lease: i64) -> Result<Keeper> {
        let mut client = self.client.clone();
        let keeper = client.lease_keep_alive(lease).await?;
        debug!(lease, "Opened lease keep-alive stream");
        Ok(keeper)
    }
}

#[async_trait]
impl LeaseClient for EtcdLeaseClient {
    async fn grant(&self, ttl: Duration) -> Result<i64> {
        let mut client = self.client.clone();
        let ttl = ttl.as_secs().max(1) as i64;
        let resp = client.lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: i64) -> Result<()> {
        let (mut keeper, mut stream) = self
            .keepers
            .checkout(lease, || self.open_keeper(lease))
            .await?;

        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                self.keepers.restore(lease, (keeper, stream));
                Ok(())
            }
            _ => Err(ClusterError::LeaseLost(lease)),
        }
    }

    async fn revoke(&self, lease: i64) -> Result<()> {
        self.keepers.forget(lease);
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            // already expired
            Err(etcd_client::Error::GRpcStatus(status))
                if status.message().contains("lease not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String> {
        let mut client = self.client.clone();
        let resp = client.campaign(election, value, lease).await?;
        let leader = resp
            .leader()
            .ok_or_else(|| ClusterError::Backend("campaign returned no leader key".into()))?;
        String::from_utf8(leader.key().to_vec())
            .map_err(|e| ClusterError::Serialization(format!("campaign key: {}", e)))
    }

    async fn resign(&self, leader_key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(leader_key, None).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        resp.kvs()
            .first()
            .map(|kv| {
                kv.value_str()
                    .map(str::to_string)
                    .map_err(|e| ClusterError::Serialization(e.to_string()))
            })
            .transpose()
    }
}
