//! In-process lease coordination service
//!
//! A small etcd look-alike: leases with a ttl, keys optionally bound to a
//! lease, a global revision counter and campaigns ordered by the creation
//! revision of their key. Expired leases are reaped lazily on every call.

use super::lease::LeaseClient;
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const CAMPAIGN_POLL: Duration = Duration::from_millis(10);

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

struct Entry {
    value: String,
    lease: Option<i64>,
    create_revision: i64,
}

#[derive(Default)]
struct Inner {
    next_lease: i64,
    revision: i64,
    available: bool,
    leases: HashMap<i64, Lease>,
    kv: BTreeMap<String, Entry>,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(ClusterError::Unavailable("lease service unreachable".into()))
        }
    }

    fn reap(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: i64) {
        if self.leases.remove(&id).is_some() {
            self.kv.retain(|_, e| e.lease != Some(id));
            debug!(lease = id, "Lease ended");
        }
    }

    fn put(&mut self, key: &str, value: &str, lease: Option<i64>) -> Result<()> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(ClusterError::LeaseLost(id));
            }
        }
        self.revision += 1;
        let revision = self.revision;
        let entry = self.kv.entry(key.to_string()).or_insert(Entry {
            value: String::new(),
            lease,
            create_revision: revision,
        });
        entry.value = value.to_string();
        entry.lease = lease;
        Ok(())
    }

    /// Oldest campaign key under `election`
    fn campaign_leader(&self, election: &str) -> Option<&str> {
        let prefix = format!("{}/", election);
        self.kv
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .min_by_key(|(_, e)| e.create_revision)
            .map(|(k, _)| k.as_str())
    }
}

/// Shared in-memory lease service; clones talk to the same service
#[derive(Clone)]
pub struct MemoryLeaseService {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryLeaseService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_lease: 1,
                available: true,
                ..Default::default()
            })),
        }
    }

    /// Simulate a service outage (or recovery); leases keep expiring
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Revoke every lease whose campaign carries `value`, as if the holder
    /// stopped renewing it
    pub fn invalidate(&self, value: &str) {
        let mut inner = self.inner.lock();
        let leases: Vec<i64> = inner
            .kv
            .values()
            .filter(|e| e.value == value)
            .filter_map(|e| e.lease)
            .collect();
        for id in leases {
            inner.drop_lease(id);
        }
    }

    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.reap();
        inner.leases.len()
    }
}

#[async_trait]
impl LeaseClient for MemoryLeaseService {
    async fn grant(&self, ttl: Duration) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.reap();

        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.reap();

        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(ClusterError::LeaseLost(lease))?;
        entry.deadline = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.drop_lease(lease);
        Ok(())
    }

    async fn campaign(&self, election: &str, value: &str, lease: i64) -> Result<String> {
        let key = format!("{}/{:x}", election, lease);
        {
            let mut inner = self.inner.lock();
            inner.check_available()?;
            inner.reap();
            if !inner.kv.contains_key(&key) {
                inner.put(&key, value, Some(lease))?;
            }
        }

        loop {
            {
                let mut inner = self.inner.lock();
                inner.check_available()?;
                inner.reap();
                if !inner.kv.contains_key(&key) {
                    return Err(ClusterError::LeaseLost(lease));
                }
                if inner.campaign_leader(election) == Some(key.as_str()) {
                    return Ok(key);
                }
            }
            tokio::time::sleep(CAMPAIGN_POLL).await;
        }
    }

    async fn resign(&self, leader_key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.kv.remove(leader_key);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.reap();
        inner.put(key, value, lease)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        inner.reap();
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_drops_keys() {
        let service = MemoryLeaseService::new();
        let lease = service.grant(Duration::from_secs(2)).await.unwrap();
        service.put("/k", "v", Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        service.keep_alive(lease).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(service.get("/k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(service.get("/k").await.unwrap().is_none());
        assert!(matches!(
            service.keep_alive(lease).await,
            Err(ClusterError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_campaign_order() {
        let service = MemoryLeaseService::new();
        let first = service.grant(Duration::from_secs(10)).await.unwrap();
        let second = service.grant(Duration::from_secs(10)).await.unwrap();

        let key = service.campaign("/e", "a", first).await.unwrap();
        assert_eq!(service.get(&key).await.unwrap().as_deref(), Some("a"));

        let waiting = {
            let service = service.clone();
            tokio::spawn(async move { service.campaign("/e", "b", second).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        service.resign(&key).await.unwrap();
        let won = waiting.await.unwrap().unwrap();
        assert_eq!(service.get(&won).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_invalidate_revokes_holder() {
        let service = MemoryLeaseService::new();
        let lease = service.grant(Duration::from_secs(10)).await.unwrap();
        service.campaign("/e", "node-1", lease).await.unwrap();
        assert_eq!(service.lease_count(), 1);

        service.invalidate("node-1");
        assert_eq!(service.lease_count(), 0);
        assert!(service.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let service = MemoryLeaseService::new();
        service.set_available(false);
        assert!(matches!(
            service.grant(Duration::from_secs(1)).await,
            Err(ClusterError::Unavailable(_))
        ));
    }
}
