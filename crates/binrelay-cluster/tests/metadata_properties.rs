//! Repository behaviour against a shared in-memory tree service

use binrelay_cluster::codec;
use binrelay_cluster::keys::KeyPaths;
use binrelay_cluster::{
    ClusterError, MemoryTree, MetadataBackend, MetadataKind, MetadataRepository, PipelineInfo,
    RefreshOutcome, SourceInfo, TransformRule, TreeBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Node {
    _dir: TempDir,
    remote: Arc<dyn MetadataBackend>,
    sources: MetadataRepository<SourceInfo>,
    pipelines: MetadataRepository<PipelineInfo>,
}

async fn node(tree: &MemoryTree) -> Node {
    let dir = TempDir::new().unwrap();
    let local = binrelay_cluster::LocalStore::open(dir.path().join("cache.redb")).unwrap();
    let backend = TreeBackend::new(
        Arc::new(tree.connect()),
        KeyPaths::new("it"),
        Duration::from_secs(1),
    );
    MetadataBackend::bootstrap(&backend).await.unwrap();
    let remote: Arc<dyn MetadataBackend> = Arc::new(backend);
    Node {
        _dir: dir,
        sources: MetadataRepository::new(local.clone(), Some(remote.clone())),
        pipelines: MetadataRepository::new(local, Some(remote.clone())),
        remote,
    }
}

#[tokio::test]
async fn test_insert_starts_at_version_one() {
    let tree = MemoryTree::new();
    let node = node(&tree).await;

    let mut source = SourceInfo::new(1, "orders", "db1", 3306);
    node.sources.cascade_insert(&mut source).await.unwrap();

    assert_eq!(source.data_version, 1);
    assert_eq!(node.sources.get(1).unwrap().data_version, 1);
    assert_eq!(node.remote.get_version(MetadataKind::Source, 1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_updates_are_consecutive_versions() {
    let tree = MemoryTree::new();
    let node = node(&tree).await;

    let mut source = SourceInfo::new(1, "orders", "db1", 3306);
    node.sources.cascade_insert(&mut source).await.unwrap();

    source.port = 3307;
    assert_eq!(node.sources.cascade_update(&mut source).await.unwrap(), 2);
    source.port = 3308;
    assert_eq!(node.sources.cascade_update(&mut source).await.unwrap(), 3);

    assert_eq!(node.remote.get_version(MetadataKind::Source, 1).await.unwrap(), 3);
    assert_eq!(node.sources.get(1).unwrap().port, 3308);
}

#[tokio::test]
async fn test_stale_writer_loses() {
    let tree = MemoryTree::new();
    let first = node(&tree).await;
    let second = node(&tree).await;

    let mut source = SourceInfo::new(1, "orders", "db1", 3306);
    first.sources.cascade_insert(&mut source).await.unwrap();
    second.sources.refresh_all().await.unwrap();

    let mut winner = first.sources.get(1).unwrap();
    winner.port = 4000;
    first.sources.cascade_update(&mut winner).await.unwrap();

    let mut loser = second.sources.get(1).unwrap();
    loser.port = 5000;
    let seen = loser.data_version;
    let err = second
        .sources
        .cascade_update_expecting(&mut loser, seen)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::VersionConflict { .. }));

    // the remote copy is untouched and the loser's cache follows it
    let (payload, version) = first.remote.get(MetadataKind::Source, 1).await.unwrap();
    assert_eq!(version, 2);
    let stored: SourceInfo = codec::decode(&payload).unwrap();
    assert_eq!(stored.port, 4000);
    assert_eq!(second.sources.get(1).unwrap().port, 4000);
}

#[tokio::test]
async fn test_refresh_one_is_noop_when_local_is_current() {
    let tree = MemoryTree::new();
    let node = node(&tree).await;

    let mut source = SourceInfo::new(1, "orders", "db1", 3306);
    node.sources.cascade_insert(&mut source).await.unwrap();

    let outcome = node.sources.refresh_one(1, Some(1)).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Unchanged);
    let outcome = node.sources.refresh_one(1, None).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Unchanged);
}

#[tokio::test]
async fn test_refresh_one_follows_remote_delete() {
    let tree = MemoryTree::new();
    let first = node(&tree).await;
    let second = node(&tree).await;

    let mut source = SourceInfo::new(1, "orders", "db1", 3306);
    first.sources.cascade_insert(&mut source).await.unwrap();
    second.sources.refresh_all().await.unwrap();
    assert!(second.sources.find(1).unwrap().is_some());

    first.sources.cascade_delete(1).await.unwrap();
    let outcome = second.sources.refresh_one(1, None).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Deleted);
    assert!(second.sources.find(1).unwrap().is_none());
}

#[tokio::test]
async fn test_refresh_all_converges_on_remote_listing() {
    let tree = MemoryTree::new();
    let writer = node(&tree).await;
    let reader = node(&tree).await;

    // reader holds {A:v1, C:v1}
    let mut a = SourceInfo::new(1, "a", "db1", 3306);
    let mut c = SourceInfo::new(3, "c", "db3", 3306);
    writer.sources.cascade_insert(&mut a).await.unwrap();
    writer.sources.cascade_insert(&mut c).await.unwrap();
    reader.sources.refresh_all().await.unwrap();

    // remote becomes {A:v2, B:v1}
    a.port = 3400;
    writer.sources.cascade_update(&mut a).await.unwrap();
    let mut b = SourceInfo::new(2, "b", "db2", 3306);
    writer.sources.cascade_insert(&mut b).await.unwrap();
    writer.sources.cascade_delete(3).await.unwrap();

    let report = reader.sources.refresh_all().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.deleted, 1);

    let versions: Vec<(u64, i32)> = reader
        .sources
        .list()
        .unwrap()
        .into_iter()
        .map(|s| (s.id, s.data_version))
        .collect();
    assert_eq!(versions, vec![(1, 2), (2, 1)]);
    assert_eq!(reader.sources.get(1).unwrap().port, 3400);
}

#[tokio::test]
async fn test_pipeline_end_to_end_between_nodes() {
    let tree = MemoryTree::new();
    let node1 = node(&tree).await;
    let node2 = node(&tree).await;

    let mut pipeline = PipelineInfo::new(100, "orders-to-kafka", 1, 2);
    pipeline.rules = vec![TransformRule::new(1001, 100, "shop", "orders")];
    node1.pipelines.cascade_insert(&mut pipeline).await.unwrap();

    node2.pipelines.refresh_all().await.unwrap();
    assert_eq!(node2.pipelines.get(100).unwrap().data_version, 1);
    assert_eq!(node2.pipelines.rules(100).unwrap().len(), 1);

    pipeline.batch_size = 2048;
    pipeline
        .rules
        .push(TransformRule::new(1002, 100, "shop", "customers"));
    assert_eq!(node1.pipelines.cascade_update(&mut pipeline).await.unwrap(), 2);

    let outcome = node2.pipelines.refresh_one(100, Some(2)).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Fetched(2));
    let seen = node2.pipelines.get(100).unwrap();
    assert_eq!(seen.data_version, 2);
    assert_eq!(seen.batch_size, 2048);
    assert_eq!(node2.pipelines.rules(100).unwrap().len(), 2);
}
