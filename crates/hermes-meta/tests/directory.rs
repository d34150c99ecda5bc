//! Single-node flows through the metadata manager: put/get fidelity,
//! refcount-guarded destruction, swap fallback, rename semantics.

use bytes::Bytes;
use hermes_bufpool::{BufferPool, SwapManager};
use hermes_common::{Config, Error, PlacementSchema, SchemaEntry, TargetId, TierConfig};
use hermes_meta::{MetaStorage, MetadataManager};
use hermes_rpc::RpcContext;
use hermes_shmem::Segment;
use std::sync::Arc;

fn node_config(dir: &tempfile::TempDir, tier: TierConfig) -> Config {
    let mut config = Config::default();
    config.tiers = vec![tier];
    config.swap.mount_point = dir.path().to_string_lossy().into_owned();
    config
}

fn manager_with(dir: &tempfile::TempDir, config: &Config) -> MetadataManager {
    let segment = Arc::new(
        Segment::create(
            dir.path().join("segment.hermes"),
            32 * 1024 * 1024,
            &config.memory,
        )
        .unwrap(),
    );
    let pool = Arc::new(BufferPool::init(segment.clone(), config).unwrap());
    let storage = MetaStorage::init(segment, config, &pool.device_capacities()).unwrap();
    let swap = SwapManager::open(&config.swap, config.node_id).unwrap();
    let rpc = Arc::new(RpcContext::new(1, vec!["http://127.0.0.1:9400".to_string()]).unwrap());
    MetadataManager::new(storage, pool, swap, config.swap.clone(), rpc)
}

fn small_ram_tier(capacity: u64) -> TierConfig {
    TierConfig {
        capacity,
        block_size: 1024,
        slab_unit_sizes: vec![1],
        desired_slab_percentages: vec![1.0],
        bandwidth_mbps: 6000.0,
        latency_us: 0.1,
        mount_point: String::new(),
    }
}

fn schema(bytes: u64) -> PlacementSchema {
    vec![SchemaEntry::new(TargetId::new(1, 0), bytes)]
}

#[tokio::test]
async fn test_single_node_put_get() {
    let dir = tempfile::tempdir().unwrap();
    // 4 KiB RAM tier carved into 1 KiB buffers.
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(4096)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload: Bytes = (0..3000u32).map(|i| i as u8).collect::<Vec<_>>().into();

    let blob_id = mdm.put_blob(bucket, "k", &payload, &schema(3000)).await.unwrap();
    assert!(!blob_id.in_swap());

    // 3000 bytes occupy three 1 KiB buffers.
    let buffers = mdm.get_buffer_id_list(blob_id).await.unwrap();
    assert_eq!(buffers.len(), 3);

    assert_eq!(mdm.get_blob(bucket, "k").await.unwrap(), payload);
    assert_eq!(mdm.get_blob_size(bucket, "k").await.unwrap(), 3000);
}

#[tokio::test]
async fn test_get_or_create_is_idempotent_and_counts_refs() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let first = mdm.get_or_create_bucket_id("shared").await.unwrap();
    let second = mdm.get_or_create_bucket_id("shared").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mdm.storage().bucket_ref_count(first), 2);

    assert_eq!(mdm.get_bucket_id("shared").await.unwrap(), first);
    assert!(mdm.get_bucket_id("absent").await.unwrap().is_null());

    mdm.increment_refcount(first).await.unwrap();
    assert_eq!(mdm.storage().bucket_ref_count(first), 3);
}

#[tokio::test]
async fn test_rename_bucket_moves_name_only() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let bucket = mdm.get_or_create_bucket_id("origin").await.unwrap();
    mdm.rename_bucket(bucket, "origin", "destination").await.unwrap();

    assert_eq!(mdm.get_bucket_id("destination").await.unwrap(), bucket);
    assert!(mdm.get_bucket_id("origin").await.unwrap().is_null());
    assert_eq!(mdm.storage().bucket_ref_count(bucket), 1);
}

#[tokio::test]
async fn test_destroy_respects_refcount() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    mdm.get_or_create_bucket_id("b").await.unwrap();
    assert_eq!(mdm.storage().bucket_ref_count(bucket), 2);

    let err = mdm.destroy_bucket("b", bucket).await.unwrap_err();
    assert!(matches!(err, Error::BucketInUse(_)));

    mdm.decrement_refcount(bucket).await.unwrap();
    assert!(mdm.destroy_bucket("b", bucket).await.is_err());

    mdm.decrement_refcount(bucket).await.unwrap();
    mdm.destroy_bucket("b", bucket).await.unwrap();

    // The slot reappears at the head of the free chain and the name is
    // gone.
    assert_eq!(mdm.storage().first_free_bucket_index(), Some(bucket.index()));
    assert!(mdm.get_bucket_id("b").await.unwrap().is_null());
}

#[tokio::test]
async fn test_swap_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(4096)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload = Bytes::from(vec![0x5A; 100]);

    // A schema far beyond the tier fails all-or-nothing.
    let err = mdm
        .put_blob(bucket, "k", &payload, &schema(1024 * 1024))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolExhausted));

    // The swap path takes the bytes and negates the home node.
    let blob_id = mdm.put_swap_blob(bucket, "k", &payload).await.unwrap();
    assert!(blob_id.in_swap());
    assert!(blob_id.node_id() < 0);
    assert!(mdm.blob_is_in_swap(bucket, "k").await.unwrap());

    assert_eq!(mdm.get_blob(bucket, "k").await.unwrap(), payload);
    assert_eq!(mdm.get_blob_size(bucket, "k").await.unwrap(), 100);
}

#[tokio::test]
async fn test_rename_preserves_binding() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload = Bytes::from_static(b"renamed payload");
    mdm.put_blob(bucket, "old", &payload, &schema(15)).await.unwrap();

    mdm.rename_blob(bucket, "old", "new").await.unwrap();
    assert!(mdm.contains_blob(bucket, "new").await.unwrap());
    assert!(!mdm.contains_blob(bucket, "old").await.unwrap());
    assert_eq!(mdm.get_blob(bucket, "new").await.unwrap(), payload);

    // Renaming the stale name again reports the missing key.
    let err = mdm.rename_blob(bucket, "old", "newer").await.unwrap_err();
    assert!(matches!(err, Error::BlobNotFound { .. }));
}

#[tokio::test]
async fn test_destroy_blob_returns_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(8192)));
    let full = mdm.pool().remaining_capacity(0);

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload = Bytes::from(vec![1u8; 2000]);
    mdm.put_blob(bucket, "k", &payload, &schema(2000)).await.unwrap();
    assert!(mdm.pool().remaining_capacity(0) < full);

    mdm.destroy_blob_by_name(bucket, "k").await.unwrap();
    assert!(!mdm.contains_blob(bucket, "k").await.unwrap());
    assert!(mdm.get_blob_id("k", bucket).await.unwrap().is_null());
    assert_eq!(mdm.pool().remaining_capacity(0), full);
}

#[tokio::test]
async fn test_put_replaces_existing_blob() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(8192)));
    let full = mdm.pool().remaining_capacity(0);

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let first = Bytes::from(vec![1u8; 3000]);
    let second = Bytes::from(vec![2u8; 1000]);
    mdm.put_blob(bucket, "k", &first, &schema(3000)).await.unwrap();
    mdm.put_blob(bucket, "k", &second, &schema(1000)).await.unwrap();

    assert_eq!(mdm.get_blob(bucket, "k").await.unwrap(), second);
    assert_eq!(mdm.get_blob_ids(bucket).await.unwrap().len(), 1);

    mdm.destroy_blob_by_name(bucket, "k").await.unwrap();
    assert_eq!(mdm.pool().remaining_capacity(0), full);
}

#[tokio::test]
async fn test_bucket_slot_pool_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(&dir, small_ram_tier(16 * 1024));
    config.directory.max_buckets_per_node = 3;
    let mdm = manager_with(&dir, &config);

    for i in 0..3 {
        mdm.get_or_create_bucket_id(&format!("bucket{i}")).await.unwrap();
    }
    let err = mdm.get_or_create_bucket_id("one-too-many").await.unwrap_err();
    assert!(matches!(err, Error::SlotExhausted("bucket")));
}

#[tokio::test]
async fn test_vbucket_lifecycle_and_links() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload = Bytes::from_static(b"linked");
    let blob_id = mdm.put_blob(bucket, "k", &payload, &schema(6)).await.unwrap();

    let vbucket = mdm.get_or_create_vbucket_id("view").await.unwrap();
    mdm.add_blob_id_to_vbucket(blob_id, vbucket).await.unwrap();

    // Unlinking from the vbucket leaves the blob in its bucket.
    assert!(mdm.storage().remove_blob_from_vbucket(vbucket, blob_id));
    assert!(mdm.contains_blob(bucket, "k").await.unwrap());

    // Renaming moves the name, not the id or the refcount.
    mdm.rename_vbucket(vbucket, "view", "view2").await.unwrap();
    assert_eq!(mdm.get_vbucket_id("view2").await.unwrap(), vbucket);
    assert!(mdm.get_vbucket_id("view").await.unwrap().is_null());

    let err = mdm.destroy_vbucket("view2", vbucket).await.unwrap_err();
    assert!(matches!(err, Error::BucketInUse(_)));
    mdm.decrement_refcount_vbucket(vbucket).await.unwrap();
    mdm.destroy_vbucket("view2", vbucket).await.unwrap();
    assert!(mdm.get_vbucket_id("view2").await.unwrap().is_null());
}

#[tokio::test]
async fn test_name_recovery_from_blob_id() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let bucket = mdm.get_or_create_bucket_id("b").await.unwrap();
    let payload = Bytes::from_static(b"named");
    let blob_id = mdm.put_blob(bucket, "findme", &payload, &schema(5)).await.unwrap();

    assert_eq!(mdm.get_blob_name_from_id(blob_id).await.unwrap(), "findme");
    assert_eq!(
        mdm.get_bucket_id_from_blob_id(blob_id).await.unwrap(),
        bucket
    );
}

#[tokio::test]
async fn test_single_node_neighborhood_is_self() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let targets = mdm.neighborhood_targets().await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].node_id(), 1);

    let capacity = mdm.remaining_target_capacity(targets[0]).await.unwrap();
    assert_eq!(capacity, mdm.pool().remaining_capacity(0));
}

#[tokio::test]
async fn test_zero_byte_schema_yields_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let mdm = manager_with(&dir, &node_config(&dir, small_ram_tier(16 * 1024)));

    let ids = hermes_bufpool::get_buffers(mdm.pool(), mdm.rpc(), &schema(0))
        .await
        .unwrap();
    assert!(ids.is_empty());
}
