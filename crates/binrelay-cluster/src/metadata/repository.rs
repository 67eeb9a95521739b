//! Composite (local + remote) repository for one entity kind

use super::intent::{Intent, IntentLog, IntentOp};
use crate::codec;
use crate::error::{ClusterError, Result};
use crate::model::{Entity, EntityStatus, MetadataKind, TransformRule};
use crate::observability::MetadataMetrics;
use crate::remote::MetadataBackend;
use crate::storage::{Bucket, LocalStore, LocalTxn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Attempts made by [`MetadataRepository::modify`] before giving up
pub const MAX_CAS_RETRIES: u32 = 5;

const BASE_BACKOFF_MS: u64 = 20;

/// Local filter for [`MetadataRepository::select_list`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Case-sensitive substring of the entity name
    pub name: Option<String>,
    pub status: Option<EntityStatus>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches<T: Entity>(&self, entity: &T) -> bool {
        if let Some(name) = &self.name {
            if !entity.name().contains(name.as_str()) {
                return false;
            }
        }
        self.status.map_or(true, |status| entity.status() == status)
    }
}

/// Result of reconciling a single id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Local copy already current (or the id has a pending write)
    Unchanged,
    /// Remote copy at this version was written locally
    Fetched(i32),
    /// Remote no longer has the id; the local copy was removed
    Deleted,
}

/// Counters of one [`MetadataRepository::refresh_all`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub fetched: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Ids left alone because a local write is still pending
    pub pending: usize,
}

/// Counters of one [`MetadataRepository::replay_intents`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Intents whose remote write landed
    pub replayed: usize,
    /// Local writes dropped in favour of the remote copy
    pub discarded: usize,
    /// Intents still pending after a retriable failure
    pub remaining: usize,
}

/// Cascading repository for one entity kind
///
/// Writes go to the local cache first and then to the remote store, which is
/// the source of truth. Without a remote backend (standalone) the local
/// cache is authoritative and every cascade touches it alone.
pub struct MetadataRepository<T: Entity> {
    local: LocalStore,
    remote: Option<Arc<dyn MetadataBackend>>,
    intents: IntentLog,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for MetadataRepository<T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
            intents: self.intents.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> MetadataRepository<T> {
    pub fn new(local: LocalStore, remote: Option<Arc<dyn MetadataBackend>>) -> Self {
        Self {
            intents: IntentLog::new(local.clone()),
            local,
            remote,
            _entity: PhantomData,
        }
    }

    pub fn standalone(local: LocalStore) -> Self {
        Self::new(local, None)
    }

    pub fn kind(&self) -> MetadataKind {
        T::KIND
    }

    pub fn is_replicated(&self) -> bool {
        self.remote.is_some()
    }

    pub fn intents(&self) -> &IntentLog {
        &self.intents
    }

    fn bucket() -> Bucket {
        Bucket::from(T::KIND)
    }

    // ==================== Local writes ====================

    /// Write `entity` to the local cache only
    pub fn save(&self, entity: &T) -> Result<()> {
        self.local.write(|txn| Self::put_entity(txn, entity))
    }

    /// Entity plus its rule set, replaced as a whole
    fn put_entity(txn: &LocalTxn, entity: &T) -> Result<()> {
        txn.put_json(Self::bucket(), entity.id(), entity)?;
        if T::KIND == MetadataKind::Pipeline {
            Self::replace_rules(txn, entity.id(), entity.rules())?;
        }
        Ok(())
    }

    fn remove_entity(txn: &LocalTxn, id: u64) -> Result<bool> {
        let removed = txn.delete(Self::bucket(), id)?;
        if T::KIND == MetadataKind::Pipeline {
            Self::replace_rules(txn, id, &[])?;
        }
        Ok(removed)
    }

    fn replace_rules(txn: &LocalTxn, pipeline_id: u64, rules: &[TransformRule]) -> Result<()> {
        for (rule_id, bytes) in txn.scan_all(Bucket::Rule)? {
            let rule: TransformRule = codec::decode(&bytes)?;
            if rule.pipeline_id == pipeline_id {
                txn.delete(Bucket::Rule, rule_id)?;
            }
        }
        for rule in rules {
            let mut rule = rule.clone();
            rule.pipeline_id = pipeline_id;
            txn.put_json(Bucket::Rule, rule.id, &rule)?;
        }
        Ok(())
    }

    /// Overwrite the local copy unless it already holds `version` or newer
    fn apply_monotonic(&self, entity: &T) -> Result<bool> {
        self.local.write(|txn| {
            if let Some(current) = txn.get_json::<T>(Self::bucket(), entity.id())? {
                if current.data_version() >= entity.data_version() {
                    return Ok(false);
                }
            }
            Self::put_entity(txn, entity)?;
            Ok(true)
        })
    }

    // ==================== Reads ====================

    pub fn get(&self, id: u64) -> Result<T> {
        self.find(id)?
            .ok_or_else(|| ClusterError::entity_not_found(T::KIND, id))
    }

    pub fn find(&self, id: u64) -> Result<Option<T>> {
        self.local.get_json(Self::bucket(), id)
    }

    /// Every locally cached entity in id order
    pub fn list(&self) -> Result<Vec<T>> {
        self.select_list(&ListFilter::all())
    }

    pub fn select_list(&self, filter: &ListFilter) -> Result<Vec<T>> {
        let mut entities = Vec::new();
        for (_, bytes) in self.local.scan_all(Self::bucket())? {
            let entity: T = codec::decode(&bytes)?;
            if filter.matches(&entity) {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Rules of a pipeline from the local rule index, in rule id order
    pub fn rules(&self, pipeline_id: u64) -> Result<Vec<TransformRule>> {
        let mut rules = Vec::new();
        for (_, bytes) in self.local.scan_all(Bucket::Rule)? {
            let rule: TransformRule = codec::decode(&bytes)?;
            if rule.pipeline_id == pipeline_id {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    fn local_versions(&self) -> Result<BTreeMap<u64, i32>> {
        self.local
            .scan_all(Self::bucket())?
            .into_iter()
            .map(|(id, bytes)| {
                let entity: T = codec::decode(&bytes)?;
                Ok((id, entity.data_version()))
            })
            .collect()
    }

    // ==================== Cascading writes ====================

    /// Insert a new entity at version 1, local first
    ///
    /// If the remote insert fails the local copy stays ahead of the remote
    /// store and its intent stays pending until replayed.
    pub async fn cascade_insert(&self, entity: &mut T) -> Result<()> {
        entity.set_data_version(1);
        let id = entity.id();

        let Some(remote) = &self.remote else {
            return self.local.write(|txn| {
                if txn.get(Self::bucket(), id)?.is_some() {
                    return Err(ClusterError::AlreadyExists(format!("{} {}", T::KIND, id)));
                }
                Self::put_entity(txn, entity)
            });
        };

        let intent = self.local.write(|txn| {
            if txn.get(Self::bucket(), id)?.is_some() {
                return Err(ClusterError::AlreadyExists(format!("{} {}", T::KIND, id)));
            }
            Self::put_entity(txn, entity)?;
            IntentLog::record(txn, &Intent::new(T::KIND, id, IntentOp::Insert))
        })?;

        let result = self.send(remote.as_ref(), intent.op, entity).await;
        MetadataMetrics::record_write(T::KIND.as_str(), "insert", result.is_ok());
        let version = result?;

        if version != entity.data_version() {
            entity.set_data_version(version);
            self.save(entity)?;
        }
        self.intents.clear(&intent)?;
        debug!(kind = %T::KIND, id, op = intent.op.as_str(), "Inserted entity");
        Ok(())
    }

    /// Update using the current remote version as the expected one
    ///
    /// Returns the new version. A concurrent writer surfaces as
    /// `VersionConflict`; re-read and retry.
    pub async fn cascade_update(&self, entity: &mut T) -> Result<i32> {
        let expected = match &self.remote {
            Some(remote) => remote.get_version(T::KIND, entity.id()).await?,
            None => self.get(entity.id())?.data_version(),
        };
        self.cascade_update_expecting(entity, expected).await
    }

    /// Update only if the stored version is still `expected`
    pub async fn cascade_update_expecting(&self, entity: &mut T, expected: i32) -> Result<i32> {
        let id = entity.id();
        let next = expected + 1;
        entity.set_data_version(next);

        let Some(remote) = &self.remote else {
            return self.local.write(|txn| {
                let current = txn
                    .get_json::<T>(Self::bucket(), id)?
                    .ok_or_else(|| ClusterError::entity_not_found(T::KIND, id))?;
                if current.data_version() != expected {
                    return Err(ClusterError::VersionConflict {
                        key: format!("{}/{}", T::KIND, id),
                        expected,
                    });
                }
                Self::put_entity(txn, entity)?;
                Ok(next)
            });
        };

        let intent = self.local.write(|txn| {
            Self::put_entity(txn, entity)?;
            IntentLog::record(txn, &Intent::new(T::KIND, id, IntentOp::Update { expected }))
        })?;

        // an earlier write of this id that never landed is carried along
        let result = self.send(remote.as_ref(), intent.op, entity).await;
        MetadataMetrics::record_write(T::KIND.as_str(), "update", result.is_ok());

        match result {
            Ok(version) => {
                if version != next {
                    entity.set_data_version(version);
                    self.save(entity)?;
                }
                self.intents.clear(&intent)?;
                debug!(kind = %T::KIND, id, version, "Updated entity");
                Ok(version)
            }
            Err(e @ ClusterError::VersionConflict { .. })
            | Err(e @ ClusterError::NotFound(_))
            | Err(e @ ClusterError::AlreadyExists(_)) => {
                if e.is_conflict() {
                    MetadataMetrics::increment_conflicts(T::KIND.as_str());
                }
                // the local write lost; fall back to whatever the remote holds
                if let Err(restore) = self.adopt_remote(remote.as_ref(), &intent).await {
                    debug!(kind = %T::KIND, id, error = %restore, "Restore deferred to replay");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write with optimistic retries
    ///
    /// `f` is applied to the freshest copy on every attempt; conflicts back
    /// off exponentially up to [`MAX_CAS_RETRIES`] attempts.
    pub async fn modify<F>(&self, id: u64, mut f: F) -> Result<T>
    where
        F: FnMut(&mut T) -> Result<()>,
    {
        for attempt in 0..MAX_CAS_RETRIES {
            let mut entity = match &self.remote {
                Some(remote) => {
                    let (payload, version) = remote.get(T::KIND, id).await?;
                    let mut entity: T = codec::decode(&payload)?;
                    entity.set_data_version(version);
                    entity
                }
                None => self.get(id)?,
            };
            let expected = entity.data_version();
            f(&mut entity)?;

            match self.cascade_update_expecting(&mut entity, expected).await {
                Ok(_) => return Ok(entity),
                Err(ClusterError::VersionConflict { .. }) => {
                    let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(attempt);
                    debug!(
                        kind = %T::KIND,
                        id,
                        "CAS conflict on attempt {}, retrying after {}ms",
                        attempt + 1,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ClusterError::TooManyRetries(format!("{} {}", T::KIND, id)))
    }

    /// Delete locally, then remotely; absent ids succeed on both sides
    pub async fn cascade_delete(&self, id: u64) -> Result<()> {
        let Some(remote) = &self.remote else {
            self.local.write(|txn| Self::remove_entity(txn, id))?;
            return Ok(());
        };

        let intent = self.local.write(|txn| {
            let expected = txn
                .get_json::<T>(Self::bucket(), id)?
                .map(|e| e.data_version());
            Self::remove_entity(txn, id)?;
            IntentLog::record(txn, &Intent::new(T::KIND, id, IntentOp::Delete { expected }))
        })?;

        let result = remote.delete(T::KIND, id).await;
        MetadataMetrics::record_write(T::KIND.as_str(), "delete", result.is_ok());
        result?;

        self.intents.clear(&intent)?;
        debug!(kind = %T::KIND, id, "Deleted entity");
        Ok(())
    }

    // ==================== Reconciliation ====================

    /// Bring one id in line with the remote store
    ///
    /// `observed` is a remote version the caller already knows about (from
    /// a change notification); a local copy at that version or newer is
    /// left alone without a remote round trip.
    pub async fn refresh_one(&self, id: u64, observed: Option<i32>) -> Result<RefreshOutcome> {
        let Some(remote) = &self.remote else {
            return Ok(RefreshOutcome::Unchanged);
        };
        if let Some(intent) = self.intents.get(id)? {
            let remote_version = match remote.get_version(T::KIND, id).await {
                Ok(version) => Some(version),
                Err(ClusterError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            return Ok(self
                .settle_pending(remote.as_ref(), &intent, remote_version)
                .await?
                .unwrap_or(RefreshOutcome::Unchanged));
        }

        let local_version = self.find(id)?.map(|e| e.data_version());
        if let (Some(local), Some(observed)) = (local_version, observed) {
            if local >= observed {
                return Ok(RefreshOutcome::Unchanged);
            }
        }

        match remote.get(T::KIND, id).await {
            Ok((payload, version)) => {
                if local_version.is_some_and(|local| local >= version) {
                    return Ok(RefreshOutcome::Unchanged);
                }
                let mut entity: T = codec::decode(&payload)?;
                entity.set_data_version(version);
                if self.apply_monotonic(&entity)? {
                    MetadataMetrics::add_refreshed(T::KIND.as_str(), 1);
                    debug!(kind = %T::KIND, id, version, "Refreshed entity");
                    Ok(RefreshOutcome::Fetched(version))
                } else {
                    Ok(RefreshOutcome::Unchanged)
                }
            }
            Err(ClusterError::NotFound(_)) => {
                if local_version.is_none() {
                    return Ok(RefreshOutcome::Unchanged);
                }
                self.local.write(|txn| Self::remove_entity(txn, id))?;
                MetadataMetrics::add_evicted(T::KIND.as_str(), 1);
                debug!(kind = %T::KIND, id, "Evicted entity removed remotely");
                Ok(RefreshOutcome::Deleted)
            }
            Err(e) => Err(e),
        }
    }

    /// Reconcile the whole kind against the remote listing
    ///
    /// Orphaned local ids are deleted and stale ones fetched. Failures on a
    /// single id are logged and counted; only the listing itself can fail
    /// the pass.
    pub async fn refresh_all(&self) -> Result<RefreshReport> {
        let Some(remote) = &self.remote else {
            return Ok(RefreshReport::default());
        };
        let started = Instant::now();

        let remote_versions: HashMap<u64, i32> = remote
            .list_versions(T::KIND)
            .await?
            .into_iter()
            .map(|v| (v.id, v.version))
            .collect();
        let pending = self.intents.pending(T::KIND)?;

        let mut report = RefreshReport::default();

        for intent in &pending {
            let remote_version = remote_versions.get(&intent.id).copied();
            match self
                .settle_pending(remote.as_ref(), intent, remote_version)
                .await
            {
                Ok(None) => report.pending += 1,
                Ok(Some(RefreshOutcome::Fetched(_))) => report.fetched += 1,
                Ok(Some(RefreshOutcome::Deleted)) => report.deleted += 1,
                Ok(Some(RefreshOutcome::Unchanged)) => {}
                Err(e) => {
                    warn!(kind = %T::KIND, id = intent.id, error = %e, "Failed to settle pending write");
                    report.failed += 1;
                }
            }
        }
        let pending: HashSet<u64> = pending.iter().map(|intent| intent.id).collect();
        let local_versions = self.local_versions()?;

        for id in local_versions.keys() {
            if remote_versions.contains_key(id) || pending.contains(id) {
                continue;
            }
            match self.local.write(|txn| Self::remove_entity(txn, *id)) {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    warn!(kind = %T::KIND, id, error = %e, "Failed to evict orphaned entity");
                    report.failed += 1;
                }
            }
        }

        let mut stale: Vec<(u64, i32)> = remote_versions
            .iter()
            .filter(|(id, version)| {
                local_versions
                    .get(*id)
                    .map_or(true, |local| *local < **version)
            })
            .map(|(id, version)| (*id, *version))
            .collect();
        stale.sort_unstable();

        for (id, _) in stale {
            if pending.contains(&id) {
                continue;
            }
            match self.fetch(remote.as_ref(), id).await {
                Ok(true) => report.fetched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(kind = %T::KIND, id, error = %e, "Failed to refresh entity");
                    report.failed += 1;
                }
            }
        }

        MetadataMetrics::add_refreshed(T::KIND.as_str(), report.fetched);
        MetadataMetrics::add_evicted(T::KIND.as_str(), report.deleted);
        MetadataMetrics::add_refresh_failures(T::KIND.as_str(), report.failed);
        MetadataMetrics::record_refresh_duration(T::KIND.as_str(), started.elapsed());

        if report.fetched + report.deleted + report.failed > 0 {
            info!(
                kind = %T::KIND,
                fetched = report.fetched,
                deleted = report.deleted,
                failed = report.failed,
                "Reconciled metadata"
            );
        }
        Ok(report)
    }

    async fn fetch(&self, remote: &dyn MetadataBackend, id: u64) -> Result<bool> {
        match remote.get(T::KIND, id).await {
            Ok((payload, version)) => {
                let mut entity: T = codec::decode(&payload)?;
                entity.set_data_version(version);
                self.apply_monotonic(&entity)
            }
            // removed between listing and fetching
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve a pending write once the remote store no longer matches the
    /// state it was based on
    ///
    /// `None` while the local copy may still be ahead of the remote one;
    /// only replay pushes it. Otherwise the write either landed (the intent
    /// is cleared) or was overtaken and the remote copy is adopted.
    async fn settle_pending(
        &self,
        remote: &dyn MetadataBackend,
        intent: &Intent,
        remote_version: Option<i32>,
    ) -> Result<Option<RefreshOutcome>> {
        if intent.op.is_ahead_of(remote_version) {
            return Ok(None);
        }

        let landed = match (self.find(intent.id)?, remote_version) {
            (None, None) => true,
            (Some(local), Some(_)) => self.remote_matches(remote, &local).await?,
            _ => false,
        };
        if landed {
            self.intents.clear(intent)?;
            return Ok(Some(RefreshOutcome::Unchanged));
        }

        self.adopt_remote(remote, intent).await?;
        warn!(
            kind = %T::KIND,
            id = intent.id,
            op = intent.op.as_str(),
            "Discarded pending local write overtaken by the remote copy"
        );
        Ok(Some(match remote_version {
            Some(version) => RefreshOutcome::Fetched(version),
            None => RefreshOutcome::Deleted,
        }))
    }

    /// Carry out `op` with the local copy, returning the remote version
    async fn send(&self, remote: &dyn MetadataBackend, op: IntentOp, local: &T) -> Result<i32> {
        let id = local.id();
        let payload = codec::encode(local)?;
        match op {
            IntentOp::Insert => remote.insert(T::KIND, id, &payload).await.map(|_| 1),
            IntentOp::Update { expected } => remote.update(T::KIND, id, expected, &payload).await,
            IntentOp::Upsert { .. } => match remote.insert(T::KIND, id, &payload).await {
                Ok(_) => Ok(1),
                Err(ClusterError::AlreadyExists(_)) => {
                    let current = remote.get_version(T::KIND, id).await?;
                    remote.update(T::KIND, id, current, &payload).await
                }
                Err(e) => Err(e),
            },
            // re-created locally after the delete was recorded
            IntentOp::Delete { .. } => remote
                .delete(T::KIND, id)
                .await
                .map(|_| local.data_version()),
        }
    }

    /// Replace the local copy with the remote one (or drop it when the
    /// remote has none), clearing `intent`
    async fn adopt_remote(&self, remote: &dyn MetadataBackend, intent: &Intent) -> Result<()> {
        let id = intent.id;
        match remote.get(T::KIND, id).await {
            Ok((payload, version)) => {
                let mut entity: T = codec::decode(&payload)?;
                entity.set_data_version(version);
                self.local.write(|txn| {
                    Self::put_entity(txn, &entity)?;
                    IntentLog::clear_in(txn, intent).map(|_| ())
                })
            }
            Err(ClusterError::NotFound(_)) => self.local.write(|txn| {
                Self::remove_entity(txn, id)?;
                IntentLog::clear_in(txn, intent).map(|_| ())
            }),
            Err(e) => Err(e),
        }
    }

    /// Push pending local writes of this kind to the remote store
    ///
    /// A write the remote store rejects as stale (or as a duplicate insert
    /// with a different payload) is dropped locally in favour of the remote
    /// copy. Retriable failures leave the intent pending.
    pub async fn replay_intents(&self) -> Result<ReplayReport> {
        let Some(remote) = &self.remote else {
            return Ok(ReplayReport::default());
        };
        let mut report = ReplayReport::default();

        for intent in self.intents.pending(T::KIND)? {
            match self.replay_one(remote.as_ref(), &intent).await {
                Ok(true) => report.replayed += 1,
                Ok(false) => report.discarded += 1,
                Err(e) => {
                    warn!(kind = %T::KIND, id = intent.id, op = intent.op.as_str(), error = %e, "Intent replay failed");
                    report.remaining += 1;
                }
            }
        }

        if report.replayed + report.discarded > 0 {
            info!(
                kind = %T::KIND,
                replayed = report.replayed,
                discarded = report.discarded,
                remaining = report.remaining,
                "Replayed pending metadata writes"
            );
        }
        Ok(report)
    }

    /// `Ok(true)` when the local write landed, `Ok(false)` when the remote
    /// copy won
    async fn replay_one(&self, remote: &dyn MetadataBackend, intent: &Intent) -> Result<bool> {
        let id = intent.id;

        let Some(local) = self.find(id)? else {
            // deleted locally since; only a delete still has work to do
            if matches!(intent.op, IntentOp::Delete { .. }) {
                remote.delete(T::KIND, id).await?;
            }
            self.intents.clear(intent)?;
            return Ok(true);
        };
        let result = self.send(remote, intent.op, &local).await;

        match result {
            Ok(version) => {
                if version != local.data_version() {
                    let mut local = local;
                    local.set_data_version(version);
                    self.save(&local)?;
                }
                self.intents.clear(intent)?;
                Ok(true)
            }
            Err(ClusterError::AlreadyExists(_))
            | Err(ClusterError::VersionConflict { .. })
            | Err(ClusterError::NotFound(_)) => {
                // the write may have landed before the crash
                if self.remote_matches(remote, &local).await? {
                    self.intents.clear(intent)?;
                    return Ok(true);
                }
                self.adopt_remote(remote, intent).await?;
                warn!(kind = %T::KIND, id, op = intent.op.as_str(), "Discarded local write in favour of remote copy");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn remote_matches(&self, remote: &dyn MetadataBackend, local: &T) -> Result<bool> {
        match remote.get(T::KIND, local.id()).await {
            Ok((payload, version)) => {
                let mut stored: T = codec::decode(&payload)?;
                stored.set_data_version(version);
                Ok(version == local.data_version()
                    && codec::encode(&stored)? == codec::encode(local)?)
            }
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPaths;
    use crate::model::{PipelineInfo, SourceInfo};
    use crate::remote::{MemoryTree, TreeBackend};
    use tempfile::TempDir;

    struct Node {
        _dir: TempDir,
        sources: MetadataRepository<SourceInfo>,
        pipelines: MetadataRepository<PipelineInfo>,
    }

    async fn backend(tree: &MemoryTree) -> Arc<dyn MetadataBackend> {
        let backend = TreeBackend::new(
            Arc::new(tree.connect()),
            KeyPaths::new("test"),
            Duration::from_secs(1),
        );
        backend.bootstrap().await.unwrap();
        Arc::new(backend)
    }

    async fn node(tree: &MemoryTree) -> Node {
        let dir = TempDir::new().unwrap();
        let local = LocalStore::open(dir.path().join("cache.redb")).unwrap();
        let remote = backend(tree).await;
        Node {
            _dir: dir,
            sources: MetadataRepository::new(local.clone(), Some(remote.clone())),
            pipelines: MetadataRepository::new(local, Some(remote)),
        }
    }

    fn standalone() -> (TempDir, MetadataRepository<SourceInfo>) {
        let dir = TempDir::new().unwrap();
        let local = LocalStore::open(dir.path().join("cache.redb")).unwrap();
        (dir, MetadataRepository::standalone(local))
    }

    #[tokio::test]
    async fn test_insert_then_get_is_version_one() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        assert_eq!(node.sources.get(1).unwrap().data_version, 1);
        assert!(node.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_updates_increment_version() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        source.port = 3307;
        assert_eq!(node.sources.cascade_update(&mut source).await.unwrap(), 2);
        source.port = 3308;
        assert_eq!(node.sources.cascade_update(&mut source).await.unwrap(), 3);

        assert_eq!(remote.get_version(MetadataKind::Source, 1).await.unwrap(), 3);
        let local = node.sources.get(1).unwrap();
        assert_eq!(local.data_version, 3);
        assert_eq!(local.port, 3308);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts_and_keeps_remote() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();
        source.port = 3307;
        node.sources.cascade_update(&mut source).await.unwrap();

        let mut stale = source.clone();
        stale.port = 9999;
        let err = node
            .sources
            .cascade_update_expecting(&mut stale, 1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let (payload, version) = remote.get(MetadataKind::Source, 1).await.unwrap();
        let stored: SourceInfo = codec::decode(&payload).unwrap();
        assert_eq!(version, 2);
        assert_eq!(stored.port, 3307);

        // local copy restored from the remote store
        assert_eq!(node.sources.get(1).unwrap().port, 3307);
        assert!(node.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_modify_applies_on_fresh_copy() {
        let tree = MemoryTree::new();
        let first = node(&tree).await;
        let second = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        first.sources.cascade_insert(&mut source).await.unwrap();

        // a write this node never cached locally
        let mut other = source.clone();
        other.name = "renamed".into();
        second.sources.cascade_update(&mut other).await.unwrap();

        let updated = first
            .sources
            .modify(1, |s| {
                s.port = 4000;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.data_version, 3);
        assert_eq!(updated.port, 4000);
        assert_eq!(updated.name, "renamed");
        assert_eq!(first.sources.get(1).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_concurrent_modify_loses_no_update() {
        let tree = MemoryTree::new();
        let first = node(&tree).await;
        let second = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 0);
        first.sources.cascade_insert(&mut source).await.unwrap();

        let bump = |repo: MetadataRepository<SourceInfo>| {
            tokio::spawn(async move {
                for _ in 0..10 {
                    repo.modify(1, |s| {
                        s.port += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
                }
            })
        };
        let a = bump(first.sources.clone());
        let b = bump(second.sources.clone());
        a.await.unwrap();
        b.await.unwrap();

        first.sources.refresh_one(1, None).await.unwrap();
        let stored = first.sources.get(1).unwrap();
        assert_eq!(stored.port, 20);
        assert_eq!(stored.data_version, 21);
    }

    #[tokio::test]
    async fn test_modify_closure_error_aborts() {
        let (_dir, repo) = standalone();
        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        repo.cascade_insert(&mut source).await.unwrap();

        let err = repo
            .modify(1, |_| Err(ClusterError::InvalidConfig("rejected".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
        assert_eq!(repo.get(1).unwrap().data_version, 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        let mut source = SourceInfo::new(5, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();
        node.sources.cascade_delete(5).await.unwrap();

        assert!(node.sources.get(5).unwrap_err().is_not_found());
        assert!(remote
            .get_version(MetadataKind::Source, 5)
            .await
            .unwrap_err()
            .is_not_found());

        // absent on both sides
        node.sources.cascade_delete(5).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_one() {
        let tree = MemoryTree::new();
        let writer = node(&tree).await;
        let reader = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        writer.sources.cascade_insert(&mut source).await.unwrap();

        assert_eq!(
            reader.sources.refresh_one(1, None).await.unwrap(),
            RefreshOutcome::Fetched(1)
        );
        // local >= observed: no-op
        assert_eq!(
            reader.sources.refresh_one(1, Some(1)).await.unwrap(),
            RefreshOutcome::Unchanged
        );

        source.port = 3307;
        writer.sources.cascade_update(&mut source).await.unwrap();
        assert_eq!(
            reader.sources.refresh_one(1, Some(2)).await.unwrap(),
            RefreshOutcome::Fetched(2)
        );
        assert_eq!(reader.sources.get(1).unwrap().port, 3307);

        writer.sources.cascade_delete(1).await.unwrap();
        assert_eq!(
            reader.sources.refresh_one(1, None).await.unwrap(),
            RefreshOutcome::Deleted
        );
        assert!(reader.sources.find(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_converges() {
        let tree = MemoryTree::new();
        let writer = node(&tree).await;
        let reader = node(&tree).await;

        // remote {A:v2, B:v1}
        let mut a = SourceInfo::new(1, "a", "db1", 3306);
        let mut b = SourceInfo::new(2, "b", "db2", 3306);
        writer.sources.cascade_insert(&mut a).await.unwrap();
        writer.sources.cascade_insert(&mut b).await.unwrap();

        // local {A:v1, C:v1}
        let mut stale_a = a.clone();
        stale_a.data_version = 1;
        reader.sources.save(&stale_a).unwrap();
        let mut c = SourceInfo::new(3, "c", "db3", 3306);
        c.data_version = 1;
        reader.sources.save(&c).unwrap();

        a.port = 3307;
        writer.sources.cascade_update(&mut a).await.unwrap();

        let report = reader.sources.refresh_all().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);

        let local: Vec<(u64, i32)> = reader
            .sources
            .list()
            .unwrap()
            .into_iter()
            .map(|s| (s.id, s.data_version))
            .collect();
        assert_eq!(local, vec![(1, 2), (2, 1)]);
        assert_eq!(reader.sources.get(1).unwrap().port, 3307);
    }

    #[tokio::test]
    async fn test_refresh_never_lowers_version() {
        let tree = MemoryTree::new();
        let writer = node(&tree).await;
        let reader = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        writer.sources.cascade_insert(&mut source).await.unwrap();

        let mut ahead = source.clone();
        ahead.data_version = 7;
        reader.sources.save(&ahead).unwrap();

        let report = reader.sources.refresh_all().await.unwrap();
        assert_eq!(report, RefreshReport::default());
        assert_eq!(reader.sources.get(1).unwrap().data_version, 7);
    }

    #[tokio::test]
    async fn test_failed_remote_write_is_replayed() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        tree.set_available(false);
        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        assert!(node.sources.cascade_insert(&mut source).await.is_err());

        // local is ahead and reconciliation must not evict it
        tree.set_available(true);
        assert_eq!(node.sources.intents().len().unwrap(), 1);
        let report = node.sources.refresh_all().await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.pending, 1);
        assert!(node.sources.find(1).unwrap().is_some());

        let replay = node.sources.replay_intents().await.unwrap();
        assert_eq!(replay.replayed, 1);
        assert!(node.sources.intents().is_empty().unwrap());
        assert_eq!(remote.get_version(MetadataKind::Source, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_conflict_remote_wins() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        // remote moved on while this node's update was stuck locally
        let mut theirs = source.clone();
        theirs.port = 5000;
        theirs.data_version = 2;
        remote
            .update(MetadataKind::Source, 1, 1, &codec::encode(&theirs).unwrap())
            .await
            .unwrap();

        let mut ours = source.clone();
        ours.port = 6000;
        ours.data_version = 2;
        let intent = Intent::new(MetadataKind::Source, 1, IntentOp::Update { expected: 1 });
        node.sources
            .local
            .write(|txn| {
                txn.put_json(Bucket::Source, 1, &ours)?;
                IntentLog::record(txn, &intent)
            })
            .unwrap();

        let replay = node.sources.replay_intents().await.unwrap();
        assert_eq!(replay.discarded, 1);
        assert_eq!(node.sources.get(1).unwrap().port, 5000);
        assert!(node.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_replay_recognises_landed_write() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        // crash after the remote insert, before the intent was cleared
        let intent = Intent::new(MetadataKind::Source, 1, IntentOp::Insert);
        node.sources
            .local
            .write(|txn| IntentLog::record(txn, &intent))
            .unwrap();

        let replay = node.sources.replay_intents().await.unwrap();
        assert_eq!(replay.replayed, 1);
        assert_eq!(node.sources.get(1).unwrap().data_version, 1);
    }

    /// Caches id 1 at version 1 on `follower`, then leaves a local update
    /// (port 1111, version 2) stranded by an outage
    async fn strand_update(tree: &MemoryTree, leader: &Node, follower: &Node) -> SourceInfo {
        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        leader.sources.cascade_insert(&mut source).await.unwrap();
        follower.sources.refresh_all().await.unwrap();
        assert_eq!(follower.sources.get(1).unwrap().data_version, 1);

        tree.set_available(false);
        let mut mine = follower.sources.get(1).unwrap();
        mine.port = 1111;
        assert!(follower
            .sources
            .cascade_update_expecting(&mut mine, 1)
            .await
            .is_err());
        tree.set_available(true);

        let local = follower.sources.get(1).unwrap();
        assert_eq!((local.port, local.data_version), (1111, 2));
        source
    }

    #[tokio::test]
    async fn test_refresh_all_adopts_overtaken_pending_update() {
        let tree = MemoryTree::new();
        let leader = node(&tree).await;
        let follower = node(&tree).await;
        let mut source = strand_update(&tree, &leader, &follower).await;

        // nobody else wrote since: the local copy is still ahead
        let report = follower.sources.refresh_all().await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(follower.sources.get(1).unwrap().port, 1111);

        source.port = 2222;
        leader.sources.cascade_update(&mut source).await.unwrap();
        source.port = 3333;
        leader.sources.cascade_update(&mut source).await.unwrap();

        let report = follower.sources.refresh_all().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.pending, 0);

        let local = follower.sources.get(1).unwrap();
        assert_eq!((local.port, local.data_version), (3333, 3));
        assert!(follower.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_one_adopts_overtaken_pending_update() {
        let tree = MemoryTree::new();
        let leader = node(&tree).await;
        let follower = node(&tree).await;
        let mut source = strand_update(&tree, &leader, &follower).await;

        assert_eq!(
            follower.sources.refresh_one(1, None).await.unwrap(),
            RefreshOutcome::Unchanged
        );
        assert_eq!(follower.sources.intents().len().unwrap(), 1);

        source.port = 2222;
        leader.sources.cascade_update(&mut source).await.unwrap();
        source.port = 3333;
        leader.sources.cascade_update(&mut source).await.unwrap();

        assert_eq!(
            follower.sources.refresh_one(1, Some(3)).await.unwrap(),
            RefreshOutcome::Fetched(3)
        );
        let local = follower.sources.get(1).unwrap();
        assert_eq!((local.port, local.data_version), (3333, 3));
        assert!(follower.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_clears_landed_pending_write() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        // crash after the remote insert, before the intent was cleared
        let intent = Intent::new(MetadataKind::Source, 1, IntentOp::Insert);
        node.sources
            .local
            .write(|txn| IntentLog::record(txn, &intent))
            .unwrap();

        let report = node.sources.refresh_all().await.unwrap();
        assert_eq!(report, RefreshReport::default());
        assert!(node.sources.intents().is_empty().unwrap());
        assert_eq!(node.sources.get(1).unwrap().data_version, 1);
    }

    #[tokio::test]
    async fn test_update_of_unreplicated_insert_is_replayed() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        tree.set_available(false);
        let mut source = SourceInfo::new(7, "orders", "db1", 3306);
        assert!(node.sources.cascade_insert(&mut source).await.is_err());
        source.port = 3307;
        assert!(node
            .sources
            .cascade_update_expecting(&mut source, 1)
            .await
            .is_err());
        tree.set_available(true);

        let pending = node.sources.intents().get(7).unwrap().unwrap();
        assert_eq!(pending.op, IntentOp::Insert);

        let replay = node.sources.replay_intents().await.unwrap();
        assert_eq!(replay.replayed, 1);
        assert_eq!(replay.discarded, 0);

        let local = node.sources.get(7).unwrap();
        let (payload, version) = remote.get(MetadataKind::Source, 7).await.unwrap();
        let stored: SourceInfo = codec::decode(&payload).unwrap();
        assert_eq!((local.port, local.data_version), (3307, 1));
        assert_eq!((stored.port, version), (3307, 1));
        assert!(node.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_update_pushes_pending_insert_once_reachable() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        tree.set_available(false);
        let mut source = SourceInfo::new(7, "orders", "db1", 3306);
        assert!(node.sources.cascade_insert(&mut source).await.is_err());
        tree.set_available(true);

        source.port = 3307;
        assert_eq!(
            node.sources
                .cascade_update_expecting(&mut source, 1)
                .await
                .unwrap(),
            1
        );
        assert_eq!(node.sources.get(7).unwrap().port, 3307);
        assert_eq!(remote.get_version(MetadataKind::Source, 7).await.unwrap(), 1);
        assert!(node.sources.intents().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_reinsert_over_pending_delete() {
        let tree = MemoryTree::new();
        let node = node(&tree).await;
        let remote = backend(&tree).await;

        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        node.sources.cascade_insert(&mut source).await.unwrap();

        tree.set_available(false);
        assert!(node.sources.cascade_delete(1).await.is_err());
        let mut again = SourceInfo::new(1, "orders", "db2", 4000);
        assert!(node.sources.cascade_insert(&mut again).await.is_err());
        tree.set_available(true);

        let pending = node.sources.intents().get(1).unwrap().unwrap();
        assert_eq!(pending.op, IntentOp::Upsert { expected: Some(1) });

        let replay = node.sources.replay_intents().await.unwrap();
        assert_eq!(replay.replayed, 1);

        let (payload, version) = remote.get(MetadataKind::Source, 1).await.unwrap();
        let stored: SourceInfo = codec::decode(&payload).unwrap();
        assert_eq!((stored.port, version), (4000, 2));
        assert_eq!(node.sources.get(1).unwrap().data_version, 2);
    }

    #[tokio::test]
    async fn test_refresh_all_counts_undecodable_payload() {
        use crate::remote::TreeClient;

        let tree = MemoryTree::new();
        let writer = node(&tree).await;
        let reader = node(&tree).await;

        for id in 1..=3 {
            let mut source = SourceInfo::new(id, &format!("source-{}", id), "db", 3306);
            writer.sources.cascade_insert(&mut source).await.unwrap();
        }
        tree.connect()
            .set(
                &KeyPaths::new("test").metadata_item(MetadataKind::Source, 2),
                b"not gzip",
                None,
            )
            .await
            .unwrap();

        let report = reader.sources.refresh_all().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.fetched, 2);
        assert!(reader.sources.find(1).unwrap().is_some());
        assert!(reader.sources.find(2).unwrap().is_none());
        assert!(reader.sources.find(3).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pipeline_rules_replaced_as_set() {
        let tree = MemoryTree::new();
        let writer = node(&tree).await;
        let reader = node(&tree).await;

        let mut pipeline = PipelineInfo::new(100, "orders-to-kafka", 1, 2)
            .with_rule(TransformRule::new(1001, 0, "shop", "orders"))
            .with_rule(TransformRule::new(1002, 0, "shop", "items"));
        writer.pipelines.cascade_insert(&mut pipeline).await.unwrap();
        assert_eq!(writer.pipelines.rules(100).unwrap().len(), 2);

        pipeline.rules = vec![TransformRule::new(1003, 100, "shop", "refunds")];
        writer.pipelines.cascade_update(&mut pipeline).await.unwrap();

        let rules = writer.pipelines.rules(100).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].full_name(), "shop.refunds");

        // rules travel with the pipeline payload
        reader.pipelines.refresh_all().await.unwrap();
        assert_eq!(reader.pipelines.rules(100).unwrap(), rules);

        writer.pipelines.cascade_delete(100).await.unwrap();
        assert!(writer.pipelines.rules(100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_list_filters() {
        let (_dir, repo) = standalone();
        for (id, name) in [(1, "orders-primary"), (2, "orders-replica"), (3, "billing")] {
            let mut source = SourceInfo::new(id, name, "db", 3306);
            if id == 2 {
                source.status = EntityStatus::Disabled;
            }
            repo.cascade_insert(&mut source).await.unwrap();
        }

        let names = |filter: ListFilter| -> Vec<String> {
            repo.select_list(&filter)
                .unwrap()
                .into_iter()
                .map(|s| s.name)
                .collect()
        };
        assert_eq!(names(ListFilter::all()).len(), 3);
        assert_eq!(
            names(ListFilter::all().name("orders")),
            vec!["orders-primary", "orders-replica"]
        );
        assert_eq!(
            names(ListFilter::all().name("orders").status(EntityStatus::Enabled)),
            vec!["orders-primary"]
        );
    }

    #[tokio::test]
    async fn test_standalone_versions() {
        let (_dir, repo) = standalone();
        let mut source = SourceInfo::new(1, "orders", "db1", 3306);
        repo.cascade_insert(&mut source).await.unwrap();
        assert!(matches!(
            repo.cascade_insert(&mut source.clone()).await,
            Err(ClusterError::AlreadyExists(_))
        ));

        assert_eq!(repo.cascade_update(&mut source).await.unwrap(), 2);
        assert!(repo
            .cascade_update_expecting(&mut source.clone(), 1)
            .await
            .unwrap_err()
            .is_conflict());

        assert_eq!(
            repo.refresh_one(1, Some(9)).await.unwrap(),
            RefreshOutcome::Unchanged
        );
        repo.cascade_delete(1).await.unwrap();
        assert!(repo.find(1).unwrap().is_none());
    }
}
