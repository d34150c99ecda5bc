//! Two-node flows over loopback gRPC: cross-shard creates, remote
//! placement, and global view convergence.

use bytes::Bytes;
use hermes_common::{Config, SchemaEntry, TargetId, TierConfig};
use hermes_daemon::HermesNode;
use hermes_meta::sysview;
use hermes_meta::MapKind;
use hermes_proto::buffer::buffer_service_server::BufferServiceServer;
use hermes_proto::metadata::metadata_service_server::MetadataServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

struct Cluster {
    nodes: Vec<HermesNode>,
    _dir: tempfile::TempDir,
}

async fn two_nodes() -> Cluster {
    let dir = tempfile::tempdir().unwrap();

    // Bind both listeners first so every node knows every address.
    let mut listeners = Vec::new();
    let mut addresses = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addresses.push(format!("http://{}", listener.local_addr().unwrap()));
        listeners.push(listener);
    }

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let node_id = i as u32 + 1;
        let mut config = Config::default();
        config.node_id = node_id;
        config.num_nodes = 2;
        config.shmem_capacity = 32 * 1024 * 1024;
        config.rpc.node_addresses = addresses.clone();
        config.swap.mount_point = dir.path().to_string_lossy().into_owned();
        config.tiers = vec![TierConfig {
            capacity: 64 * 1024,
            block_size: 1024,
            slab_unit_sizes: vec![1, 4],
            desired_slab_percentages: vec![0.5, 0.5],
            bandwidth_mbps: 6000.0,
            latency_us: 0.1,
            mount_point: String::new(),
        }];

        let node =
            HermesNode::bootstrap(&config, dir.path().join(format!("node{node_id}.hermes")))
                .unwrap();

        let service = node.service();
        tokio::spawn(
            Server::builder()
                .add_service(MetadataServiceServer::new(service.clone()))
                .add_service(BufferServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        nodes.push(node);
    }

    Cluster { nodes, _dir: dir }
}

/// A bucket name whose hash owner is `shard` in a two-node ring.
fn name_on_shard(cluster: &Cluster, shard: u32) -> String {
    let storage = cluster.nodes[0].manager().storage();
    (0..)
        .map(|i| format!("bucket{i}"))
        .find(|name| storage.shard_for(name, 2) == shard)
        .unwrap()
}

#[tokio::test]
async fn test_cross_shard_create() {
    let cluster = two_nodes().await;
    let name = name_on_shard(&cluster, 2);

    // Node 1 asks; node 2 creates and owns.
    let id = cluster.nodes[0]
        .manager()
        .get_or_create_bucket_id(&name)
        .await
        .unwrap();
    assert_eq!(id.node_id(), 2);

    // The entry lives only in the owner's local map.
    let on_owner = cluster.nodes[1]
        .manager()
        .storage()
        .local_get(&name, MapKind::Bucket);
    assert_eq!(on_owner, id.to_bits());
    let on_caller = cluster.nodes[0]
        .manager()
        .storage()
        .local_get(&name, MapKind::Bucket);
    assert_eq!(on_caller, 0);

    // Re-opening from the owner's side resolves to the same id.
    let again = cluster.nodes[1]
        .manager()
        .get_or_create_bucket_id(&name)
        .await
        .unwrap();
    assert_eq!(again, id);
}

#[tokio::test]
async fn test_remote_placement_roundtrip() {
    let cluster = two_nodes().await;
    let name = name_on_shard(&cluster, 1);

    let bucket = cluster.nodes[0]
        .manager()
        .get_or_create_bucket_id(&name)
        .await
        .unwrap();

    // Node 1 places the blob on node 2's RAM device.
    let payload: Bytes = (0..3000u32).map(|i| i as u8).collect::<Vec<_>>().into();
    let schema = vec![SchemaEntry::new(TargetId::new(2, 0), 3000)];
    let blob_id = cluster.nodes[0]
        .manager()
        .put_blob(bucket, "remote-blob", &payload, &schema)
        .await
        .unwrap();
    assert!(!blob_id.in_swap());

    // Every buffer belongs to node 2.
    let buffers = cluster.nodes[0]
        .manager()
        .get_buffer_id_list(blob_id)
        .await
        .unwrap();
    assert!(buffers.iter().all(|b| b.node_id() == 2));

    // Both sides read the same bytes back.
    for node in &cluster.nodes {
        assert_eq!(
            node.manager().get_blob(bucket, "remote-blob").await.unwrap(),
            payload
        );
    }
    assert_eq!(
        cluster.nodes[1]
            .manager()
            .get_blob_size(bucket, "remote-blob")
            .await
            .unwrap(),
        3000
    );
}

#[tokio::test]
async fn test_remote_destroy_restores_capacity() {
    let cluster = two_nodes().await;
    let owner_pool = cluster.nodes[1].manager().pool().clone();
    let full = owner_pool.remaining_capacity(0);

    let name = name_on_shard(&cluster, 2);
    let bucket = cluster.nodes[0]
        .manager()
        .get_or_create_bucket_id(&name)
        .await
        .unwrap();

    let payload = Bytes::from(vec![9u8; 2000]);
    let schema = vec![SchemaEntry::new(TargetId::new(2, 0), 2000)];
    cluster.nodes[0]
        .manager()
        .put_blob(bucket, "k", &payload, &schema)
        .await
        .unwrap();
    assert!(owner_pool.remaining_capacity(0) < full);
    assert!(cluster.nodes[1]
        .manager()
        .contains_blob(bucket, "k")
        .await
        .unwrap());

    cluster.nodes[1]
        .manager()
        .destroy_blob_by_name(bucket, "k")
        .await
        .unwrap();
    assert!(!cluster.nodes[0]
        .manager()
        .contains_blob(bucket, "k")
        .await
        .unwrap());
    assert_eq!(owner_pool.remaining_capacity(0), full);
}

#[tokio::test]
async fn test_global_view_convergence() {
    let cluster = two_nodes().await;
    let node1 = cluster.nodes[0].manager();
    let node2 = cluster.nodes[1].manager();

    // Flush node 1's own init-time adjustments, then snapshot.
    sysview::update_global_sysview(node1.storage(), node1.pool(), node1.rpc())
        .await
        .unwrap();
    let before = sysview::global_device_capacities(node1.storage(), node1.rpc())
        .await
        .unwrap();

    // Allocate on node 2's device and drain one reconciliation tick.
    let ids = node2
        .pool()
        .local_get_buffers(&[SchemaEntry::new(TargetId::new(2, 0), 4096)])
        .unwrap();
    let allocated: u64 = ids
        .iter()
        .map(|&id| u64::from(node2.pool().header_for(id).unwrap().capacity))
        .sum();
    sysview::update_global_sysview(node2.storage(), node2.pool(), node2.rpc())
        .await
        .unwrap();

    // Node 1 holds the global state; both nodes observe the decrement.
    let after = sysview::global_device_capacities(node1.storage(), node1.rpc())
        .await
        .unwrap();
    assert_eq!(after[0], before[0] - allocated);

    let seen_from_node2 = sysview::global_device_capacities(node2.storage(), node2.rpc())
        .await
        .unwrap();
    assert_eq!(seen_from_node2, after);

    // Releasing converges back.
    node2.pool().local_release_buffers(&ids).unwrap();
    sysview::update_global_sysview(node2.storage(), node2.pool(), node2.rpc())
        .await
        .unwrap();
    let restored = sysview::global_device_capacities(node1.storage(), node1.rpc())
        .await
        .unwrap();
    assert_eq!(restored[0], before[0]);
}

#[tokio::test]
async fn test_neighborhood_targets_two_nodes() {
    let cluster = two_nodes().await;

    let targets = cluster.nodes[0]
        .manager()
        .neighborhood_targets()
        .await
        .unwrap();
    // Own device plus the single neighbor's device.
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].node_id(), 1);
    assert_eq!(targets[1].node_id(), 2);

    let remote_capacity = cluster.nodes[0]
        .manager()
        .remaining_target_capacity(targets[1])
        .await
        .unwrap();
    assert_eq!(
        remote_capacity,
        cluster.nodes[1].manager().pool().remaining_capacity(0)
    );
}
