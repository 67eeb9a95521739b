//! Durable log of cascade writes awaiting remote acknowledgement
//!
//! A cascade write commits the entity and its intent in one local
//! transaction, then clears the intent once the remote write returns. An
//! intent that survives a crash (or a failed remote call) marks a local copy
//! that may be ahead of the remote store; the leader replays it later.

use crate::error::Result;
use crate::model::MetadataKind;
use crate::storage::{Bucket, LocalStore, LocalTxn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Remote operation that still has to land
///
/// `expected` is the remote version the local write was based on, when
/// known. It tells a write the remote store has not seen yet apart from one
/// another writer has already overtaken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum IntentOp {
    Insert,
    Update { expected: i32 },
    /// Re-created locally over a write that never landed remotely
    Upsert { expected: Option<i32> },
    Delete { expected: Option<i32> },
}

impl IntentOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentOp::Insert => "insert",
            IntentOp::Update { .. } => "update",
            IntentOp::Upsert { .. } => "upsert",
            IntentOp::Delete { .. } => "delete",
        }
    }

    /// Fold a newer write of the same id into this pending one
    ///
    /// The result is the single remote operation that takes the remote
    /// store from where it was before `self` to where the local copy is
    /// after `next`.
    pub fn merge(self, next: IntentOp) -> IntentOp {
        let base = self.expected();
        match (self, next) {
            (IntentOp::Insert, IntentOp::Delete { .. }) => IntentOp::Delete { expected: None },
            (_, IntentOp::Delete { .. }) => IntentOp::Delete { expected: base },
            (IntentOp::Insert, _) => IntentOp::Insert,
            (IntentOp::Update { expected }, IntentOp::Update { .. }) => {
                IntentOp::Update { expected }
            }
            (IntentOp::Delete { expected: None }, IntentOp::Insert) => IntentOp::Insert,
            _ => IntentOp::Upsert { expected: base },
        }
    }

    /// Whether a remote copy at `remote` (`None` when absent) has not yet
    /// seen this write and nobody else has written since
    pub fn is_ahead_of(&self, remote: Option<i32>) -> bool {
        match *self {
            IntentOp::Insert => remote.is_none(),
            IntentOp::Update { expected } => remote == Some(expected),
            IntentOp::Upsert { expected } => remote.is_none() || remote == expected,
            IntentOp::Delete { expected } => expected.is_some() && remote == expected,
        }
    }

    fn expected(&self) -> Option<i32> {
        match *self {
            IntentOp::Insert => None,
            IntentOp::Update { expected } => Some(expected),
            IntentOp::Upsert { expected } | IntentOp::Delete { expected } => expected,
        }
    }
}

/// One pending cascade write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: MetadataKind,
    pub id: u64,
    #[serde(flatten)]
    pub op: IntentOp,
    /// Unix millis at which the local half committed
    pub recorded_at: i64,
}

impl Intent {
    pub fn new(kind: MetadataKind, id: u64, op: IntentOp) -> Self {
        Self {
            kind,
            id,
            op,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Intent bucket of the local store
///
/// Entity ids are unique across kinds, so the log keeps at most one intent
/// per id. A newer write of the same id is merged into the pending intent
/// (see [`IntentOp::merge`]).
#[derive(Debug, Clone)]
pub struct IntentLog {
    local: LocalStore,
}

impl IntentLog {
    pub fn new(local: LocalStore) -> Self {
        Self { local }
    }

    /// Record `intent` as part of an enclosing write, returning the stored
    /// intent the remote write must carry out and later clear
    pub fn record(txn: &LocalTxn, intent: &Intent) -> Result<Intent> {
        let stored = match txn.get_json::<Intent>(Bucket::Intent, intent.id)? {
            Some(pending) => Intent {
                kind: intent.kind,
                id: intent.id,
                op: pending.op.merge(intent.op),
                // distinct from the pending one so its clear cannot match
                recorded_at: intent.recorded_at.max(pending.recorded_at + 1),
            },
            None => intent.clone(),
        };
        txn.put_json(Bucket::Intent, stored.id, &stored)?;
        Ok(stored)
    }

    /// Clear `intent` unless a newer one for the same id replaced it
    pub fn clear(&self, intent: &Intent) -> Result<bool> {
        self.local.write(|txn| Self::clear_in(txn, intent))
    }

    pub fn clear_in(txn: &LocalTxn, intent: &Intent) -> Result<bool> {
        match txn.get_json::<Intent>(Bucket::Intent, intent.id)? {
            Some(current) if current == *intent => txn.delete(Bucket::Intent, intent.id),
            _ => Ok(false),
        }
    }

    pub fn get(&self, id: u64) -> Result<Option<Intent>> {
        self.local.get_json(Bucket::Intent, id)
    }

    pub fn contains(&self, id: u64) -> Result<bool> {
        Ok(self.local.get(Bucket::Intent, id)?.is_some())
    }

    /// Pending intents of `kind` in id order
    pub fn pending(&self, kind: MetadataKind) -> Result<Vec<Intent>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|intent| intent.kind == kind)
            .collect())
    }

    pub fn pending_ids(&self, kind: MetadataKind) -> Result<HashSet<u64>> {
        Ok(self.pending(kind)?.into_iter().map(|i| i.id).collect())
    }

    pub fn all(&self) -> Result<Vec<Intent>> {
        self.local
            .scan_all(Bucket::Intent)?
            .into_iter()
            .map(|(_, bytes)| crate::codec::decode(&bytes))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.local.scan_all(Bucket::Intent)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("cache.redb")).unwrap();
        let log = IntentLog::new(store.clone());

        let intent = Intent::new(MetadataKind::Pipeline, 7, IntentOp::Update { expected: 2 });
        store.write(|txn| IntentLog::record(txn, &intent)).unwrap();

        assert!(log.contains(7).unwrap());
        assert_eq!(log.get(7).unwrap(), Some(intent.clone()));
        assert_eq!(log.pending_ids(MetadataKind::Pipeline).unwrap().len(), 1);
        assert!(log.pending(MetadataKind::Source).unwrap().is_empty());

        assert!(log.clear(&intent).unwrap());
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_clear_keeps_newer_intent() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("cache.redb")).unwrap();
        let log = IntentLog::new(store.clone());

        let first = Intent::new(MetadataKind::Source, 1, IntentOp::Update { expected: 1 });
        let second = Intent::new(MetadataKind::Source, 1, IntentOp::Update { expected: 2 });

        let first = store.write(|txn| IntentLog::record(txn, &first)).unwrap();
        let second = store.write(|txn| IntentLog::record(txn, &second)).unwrap();
        assert!(second.recorded_at > first.recorded_at);

        assert!(!log.clear(&first).unwrap());
        assert_eq!(log.get(1).unwrap(), Some(second.clone()));
        assert!(log.clear(&second).unwrap());
    }

    #[test]
    fn test_update_keeps_pending_insert() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("cache.redb")).unwrap();
        let log = IntentLog::new(store.clone());

        let insert = Intent::new(MetadataKind::Source, 7, IntentOp::Insert);
        let update = Intent::new(MetadataKind::Source, 7, IntentOp::Update { expected: 1 });
        store.write(|txn| IntentLog::record(txn, &insert)).unwrap();
        let stored = store.write(|txn| IntentLog::record(txn, &update)).unwrap();

        assert_eq!(stored.op, IntentOp::Insert);
        assert_eq!(log.get(7).unwrap(), Some(stored));
    }

    #[test]
    fn test_merge() {
        use IntentOp::*;

        assert_eq!(Insert.merge(Update { expected: 1 }), Insert);
        assert_eq!(Insert.merge(Delete { expected: Some(1) }), Delete { expected: None });
        assert_eq!(
            Update { expected: 3 }.merge(Update { expected: 4 }),
            Update { expected: 3 }
        );
        assert_eq!(
            Update { expected: 3 }.merge(Delete { expected: Some(4) }),
            Delete { expected: Some(3) }
        );
        assert_eq!(
            Delete { expected: Some(3) }.merge(Insert),
            Upsert { expected: Some(3) }
        );
        assert_eq!(
            Upsert { expected: Some(3) }.merge(Update { expected: 1 }),
            Upsert { expected: Some(3) }
        );
        assert_eq!(Delete { expected: None }.merge(Insert), Insert);
    }

    #[test]
    fn test_is_ahead_of() {
        assert!(IntentOp::Insert.is_ahead_of(None));
        assert!(!IntentOp::Insert.is_ahead_of(Some(1)));

        let update = IntentOp::Update { expected: 1 };
        assert!(update.is_ahead_of(Some(1)));
        assert!(!update.is_ahead_of(Some(3)));
        assert!(!update.is_ahead_of(None));

        let delete = IntentOp::Delete { expected: Some(2) };
        assert!(delete.is_ahead_of(Some(2)));
        assert!(!delete.is_ahead_of(None));
        assert!(!delete.is_ahead_of(Some(3)));

        let upsert = IntentOp::Upsert { expected: Some(2) };
        assert!(upsert.is_ahead_of(None));
        assert!(upsert.is_ahead_of(Some(2)));
        assert!(!upsert.is_ahead_of(Some(3)));
    }

    #[test]
    fn test_serialized_shape() {
        let intent = Intent {
            kind: MetadataKind::Endpoint,
            id: 3,
            op: IntentOp::Update { expected: 4 },
            recorded_at: 10,
        };
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["kind"], "endpoint");
        assert_eq!(json["op"], "update");
        assert_eq!(json["expected"], 4);
    }
}
