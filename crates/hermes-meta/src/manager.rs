//! The public metadata directory operations.
//!
//! Every operation exists in two forms with identical behavior: a
//! `local_*` form that mutates this node's shared memory, and a
//! dispatching form that hashes the target key (or reads the owner out of
//! the id itself) and either runs the local form or issues the same-named
//! remote procedure. Two concurrent creates for one name therefore
//! resolve to the same id because both funnel through the name's hash
//! owner.

use crate::storage::{MapKind, MetaStorage};
use bytes::Bytes;
use hermes_bufpool::{io, read_swap_blob, BufferPool, SwapManager};
use hermes_common::{
    external_blob_name, hex_prefix_to_u64, make_internal_blob_name, validate_blob_name,
    validate_bucket_name, validate_vbucket_name, BlobId, BucketId, BufferId, Error,
    PlacementSchema, Result, SwapBlob, SwapConfig, TargetId, VBucketId,
};
use hermes_proto::metadata as proto;
use hermes_rpc::RpcContext;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn proto_map_kind(kind: MapKind) -> i32 {
    match kind {
        MapKind::Bucket => proto::MapKind::Bucket as i32,
        MapKind::VBucket => proto::MapKind::Vbucket as i32,
        MapKind::Blob => proto::MapKind::Blob as i32,
    }
}

/// The per-node metadata manager: the directory half of the Hermes core.
pub struct MetadataManager {
    storage: MetaStorage,
    pool: Arc<BufferPool>,
    swap: SwapManager,
    swap_config: SwapConfig,
    rpc: Arc<RpcContext>,
}

impl MetadataManager {
    #[must_use]
    pub fn new(
        storage: MetaStorage,
        pool: Arc<BufferPool>,
        swap: SwapManager,
        swap_config: SwapConfig,
        rpc: Arc<RpcContext>,
    ) -> Self {
        Self {
            storage,
            pool,
            swap,
            swap_config,
            rpc,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &MetaStorage {
        &self.storage
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[must_use]
    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcContext> {
        &self.rpc
    }

    /// The shard that owns `key`.
    fn shard(&self, key: &str) -> u32 {
        self.storage.shard_for(key, self.rpc.num_nodes())
    }

    // ------------------------------------------------------------------
    // Raw sharded map operations
    // ------------------------------------------------------------------

    async fn get_id(&self, key: &str, kind: MapKind) -> Result<u64> {
        let target = self.shard(key);
        if self.rpc.is_local(target) {
            Ok(self.storage.local_get(key, kind))
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .get(proto::GetRequest {
                    key: key.to_string(),
                    map: proto_map_kind(kind),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .id)
        }
    }

    async fn put_id(&self, key: &str, id: u64, kind: MapKind) -> Result<()> {
        let target = self.shard(key);
        if self.rpc.is_local(target) {
            self.storage.local_put(key, id, kind)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .put(proto::PutRequest {
                    key: key.to_string(),
                    id,
                    map: proto_map_kind(kind),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    async fn delete_id(&self, key: &str, kind: MapKind) -> Result<()> {
        let target = self.shard(key);
        if self.rpc.is_local(target) {
            self.storage.local_delete(key, kind);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .delete(proto::DeleteRequest {
                    key: key.to_string(),
                    map: proto_map_kind(kind),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Bucket lifecycle
    // ------------------------------------------------------------------

    /// Open an existing bucket or create a fresh one, incrementing its
    /// refcount either way.
    pub async fn get_or_create_bucket_id(&self, name: &str) -> Result<BucketId> {
        validate_bucket_name(name)?;
        let target = self.shard(name);
        if self.rpc.is_local(target) {
            self.local_get_or_create_bucket_id(name)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            let id = client
                .get_or_create_bucket_id(proto::NameRequest {
                    name: name.to_string(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .id;
            Ok(BucketId::from_bits(id))
        }
    }

    /// The local form of [`Self::get_or_create_bucket_id`]; only valid on
    /// the name's hash owner.
    pub fn local_get_or_create_bucket_id(&self, name: &str) -> Result<BucketId> {
        let guard = self.storage.bucket_mutex().lock();
        let existing = BucketId::from_bits(self.storage.local_get(name, MapKind::Bucket));
        if !existing.is_null() {
            info!(name, "opening bucket");
            self.storage.incr_bucket_refcount(existing);
            return Ok(existing);
        }

        info!(name, "creating bucket");
        let id = self.storage.acquire_bucket_slot(&guard)?;
        if let Err(err) = self.storage.local_put(name, id.to_bits(), MapKind::Bucket) {
            self.storage.release_bucket_slot(id, &guard);
            return Err(err);
        }
        Ok(id)
    }

    /// Resolve a bucket name; the null id when absent.
    pub async fn get_bucket_id(&self, name: &str) -> Result<BucketId> {
        Ok(BucketId::from_bits(self.get_id(name, MapKind::Bucket).await?))
    }

    /// Destroy a bucket: refuses while references remain, otherwise
    /// destroys its blobs, returns its slot to the free list and deletes
    /// the name mapping.
    pub async fn destroy_bucket(&self, name: &str, id: BucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.local_destroy_bucket(name, id).await
        } else {
            let mut client = self.rpc.metadata(target).await?;
            let destroyed = client
                .destroy_bucket(proto::DestroyBucketRequest {
                    name: name.to_string(),
                    bucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .value;
            if destroyed {
                Ok(())
            } else {
                Err(Error::BucketInUse(name.to_string()))
            }
        }
    }

    /// The local form of [`Self::destroy_bucket`]; only valid on the
    /// bucket's home node.
    pub async fn local_destroy_bucket(&self, name: &str, id: BucketId) -> Result<()> {
        if self.storage.bucket_ref_count(id) > 0 {
            debug!(name, "destroy refused, bucket in use");
            return Err(Error::BucketInUse(name.to_string()));
        }

        info!(name, "destroying bucket");
        for blob_id in self.storage.bucket_blob_ids(id) {
            self.destroy_blob_by_id(blob_id, id).await?;
        }
        {
            let guard = self.storage.bucket_mutex().lock();
            self.storage.release_bucket_slot(id, &guard);
        }
        self.delete_id(name, MapKind::Bucket).await
    }

    /// Rename a bucket: the id is untouched, the name mapping moves.
    pub async fn rename_bucket(&self, id: BucketId, old_name: &str, new_name: &str) -> Result<()> {
        validate_bucket_name(new_name)?;
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.local_rename_bucket(id, old_name, new_name).await
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .rename_bucket(proto::RenameBucketRequest {
                    bucket_id: id.to_bits(),
                    old_name: old_name.to_string(),
                    new_name: new_name.to_string(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// The local form of [`Self::rename_bucket`]. The two name keys may
    /// live on other shards, so this still dispatches per key.
    pub async fn local_rename_bucket(
        &self,
        id: BucketId,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        info!(old_name, new_name, "renaming bucket");
        self.delete_id(old_name, MapKind::Bucket).await?;
        self.put_id(new_name, id.to_bits(), MapKind::Bucket).await
    }

    /// Increment a bucket's refcount (client open).
    pub async fn increment_refcount(&self, id: BucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.storage.incr_bucket_refcount(id);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .increment_refcount(proto::BucketIdRequest {
                    bucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Decrement a bucket's refcount (client close).
    pub async fn decrement_refcount(&self, id: BucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.storage.decr_bucket_refcount(id);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .decrement_refcount(proto::BucketIdRequest {
                    bucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // VBucket lifecycle
    // ------------------------------------------------------------------

    /// Open an existing vbucket or create a fresh one.
    pub async fn get_or_create_vbucket_id(&self, name: &str) -> Result<VBucketId> {
        validate_vbucket_name(name)?;
        let target = self.shard(name);
        if self.rpc.is_local(target) {
            self.local_get_or_create_vbucket_id(name)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            let id = client
                .get_or_create_v_bucket_id(proto::NameRequest {
                    name: name.to_string(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .id;
            Ok(VBucketId::from_bits(id))
        }
    }

    /// The local form of [`Self::get_or_create_vbucket_id`].
    pub fn local_get_or_create_vbucket_id(&self, name: &str) -> Result<VBucketId> {
        let guard = self.storage.vbucket_mutex().lock();
        let existing = VBucketId::from_bits(self.storage.local_get(name, MapKind::VBucket));
        if !existing.is_null() {
            info!(name, "opening vbucket");
            self.storage.incr_vbucket_refcount(existing);
            return Ok(existing);
        }

        info!(name, "creating vbucket");
        let id = self.storage.acquire_vbucket_slot(&guard)?;
        if let Err(err) = self.storage.local_put(name, id.to_bits(), MapKind::VBucket) {
            self.storage.release_vbucket_slot(id, &guard);
            return Err(err);
        }
        Ok(id)
    }

    /// Resolve a vbucket name; the null id when absent.
    pub async fn get_vbucket_id(&self, name: &str) -> Result<VBucketId> {
        Ok(VBucketId::from_bits(
            self.get_id(name, MapKind::VBucket).await?,
        ))
    }

    /// Destroy a vbucket: refuses while references remain. Linked blobs
    /// are unlinked, never destroyed; they still belong to their buckets.
    pub async fn destroy_vbucket(&self, name: &str, id: VBucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.local_destroy_vbucket(name, id).await
        } else {
            let mut client = self.rpc.metadata(target).await?;
            let destroyed = client
                .destroy_v_bucket(proto::DestroyVBucketRequest {
                    name: name.to_string(),
                    vbucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .value;
            if destroyed {
                Ok(())
            } else {
                Err(Error::BucketInUse(name.to_string()))
            }
        }
    }

    /// The local form of [`Self::destroy_vbucket`].
    pub async fn local_destroy_vbucket(&self, name: &str, id: VBucketId) -> Result<()> {
        if self.storage.vbucket_ref_count(id) > 0 {
            return Err(Error::BucketInUse(name.to_string()));
        }
        info!(name, "destroying vbucket");
        {
            let guard = self.storage.vbucket_mutex().lock();
            self.storage.release_vbucket_slot(id, &guard);
        }
        self.delete_id(name, MapKind::VBucket).await
    }

    /// Rename a vbucket: the id is untouched, the name mapping moves
    /// between its shards.
    pub async fn rename_vbucket(
        &self,
        id: VBucketId,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        validate_vbucket_name(new_name)?;
        info!(old_name, new_name, "renaming vbucket");
        self.delete_id(old_name, MapKind::VBucket).await?;
        self.put_id(new_name, id.to_bits(), MapKind::VBucket).await
    }

    /// Increment a vbucket's refcount (client open).
    pub async fn increment_refcount_vbucket(&self, id: VBucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.storage.incr_vbucket_refcount(id);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .increment_refcount_v_bucket(proto::VBucketIdRequest {
                    vbucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Decrement a vbucket's refcount.
    pub async fn decrement_refcount_vbucket(&self, id: VBucketId) -> Result<()> {
        let target = id.node_id();
        if self.rpc.is_local(target) {
            self.storage.decr_vbucket_refcount(id);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .decrement_refcount_v_bucket(proto::VBucketIdRequest {
                    vbucket_id: id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Blob binding
    // ------------------------------------------------------------------

    /// Resolve a blob name within its bucket; the null id when absent.
    pub async fn get_blob_id(&self, name: &str, bucket_id: BucketId) -> Result<BlobId> {
        let internal = make_internal_blob_name(name, bucket_id);
        Ok(BlobId::from_bits(self.get_id(&internal, MapKind::Blob).await?))
    }

    /// Store a buffer-id list on `target_node`, returning the heap offset
    /// that the blob id will carry.
    pub async fn allocate_buffer_id_list(
        &self,
        target_node: u32,
        buffer_ids: &[BufferId],
    ) -> Result<u32> {
        if self.rpc.is_local(target_node) {
            self.storage.alloc_buffer_id_list(buffer_ids)
        } else {
            let mut client = self.rpc.metadata(target_node).await?;
            Ok(client
                .allocate_buffer_id_list(proto::AllocateBufferIdListRequest {
                    buffer_ids: buffer_ids.iter().map(|id| id.to_bits()).collect(),
                })
                .await
                .map_err(|status| self.rpc.failed(target_node, status))?
                .into_inner()
                .offset)
        }
    }

    /// The ordered buffer list a blob id decodes to, fetched from its
    /// owner.
    pub async fn get_buffer_id_list(&self, blob_id: BlobId) -> Result<Vec<BufferId>> {
        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            self.storage.buffer_id_list(blob_id.buffer_ids_offset())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .get_buffer_id_list(proto::BlobIdRequest {
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .buffer_ids
                .into_iter()
                .map(BufferId::from_bits)
                .collect())
        }
    }

    /// Release a blob's buffer-id list back to its owner's heap.
    pub async fn free_buffer_id_list(&self, blob_id: BlobId) -> Result<()> {
        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            self.storage.free_buffer_id_list(blob_id.buffer_ids_offset())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .free_buffer_id_list(proto::BlobIdRequest {
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Bind a buffer list to a blob name and register it in its bucket.
    /// The blob's home is the hash owner of its internal name; a swap
    /// blob gets a negated node id.
    pub async fn attach_blob_to_bucket(
        &self,
        blob_name: &str,
        bucket_id: BucketId,
        buffer_ids: &[BufferId],
        is_swap_blob: bool,
    ) -> Result<BlobId> {
        validate_blob_name(blob_name)?;
        let internal = make_internal_blob_name(blob_name, bucket_id);
        let target = self.shard(&internal);

        let offset = self.allocate_buffer_id_list(target, buffer_ids).await?;
        let node = if is_swap_blob {
            -(target as i32)
        } else {
            target as i32
        };
        let blob_id = BlobId::new(node, offset);

        self.put_id(&internal, blob_id.to_bits(), MapKind::Blob).await?;
        self.add_blob_id_to_bucket(blob_id, bucket_id).await?;
        Ok(blob_id)
    }

    /// Register a blob id in its bucket's blob list.
    pub async fn add_blob_id_to_bucket(&self, blob_id: BlobId, bucket_id: BucketId) -> Result<()> {
        let target = bucket_id.node_id();
        if self.rpc.is_local(target) {
            self.storage.append_blob_to_bucket(bucket_id, blob_id)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .add_blob_id_to_bucket(proto::BucketBlobRequest {
                    bucket_id: bucket_id.to_bits(),
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Link a blob id into a vbucket.
    pub async fn add_blob_id_to_vbucket(
        &self,
        blob_id: BlobId,
        vbucket_id: VBucketId,
    ) -> Result<()> {
        let target = vbucket_id.node_id();
        if self.rpc.is_local(target) {
            self.storage.append_blob_to_vbucket(vbucket_id, blob_id)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .add_blob_id_to_v_bucket(proto::VBucketBlobRequest {
                    vbucket_id: vbucket_id.to_bits(),
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Drop a blob id from its bucket's blob list.
    pub async fn remove_blob_from_bucket_info(
        &self,
        bucket_id: BucketId,
        blob_id: BlobId,
    ) -> Result<()> {
        let target = bucket_id.node_id();
        if self.rpc.is_local(target) {
            self.storage.remove_blob_from_bucket(bucket_id, blob_id);
            Ok(())
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .remove_blob_from_bucket_info(proto::BucketBlobRequest {
                    bucket_id: bucket_id.to_bits(),
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// Destroy a blob by name: release its buffers and list, drop it from
    /// the bucket, delete the directory entry. Absent blobs are a no-op.
    pub async fn destroy_blob_by_name(&self, bucket_id: BucketId, name: &str) -> Result<()> {
        let blob_id = self.get_blob_id(name, bucket_id).await?;
        if blob_id.is_null() {
            return Ok(());
        }

        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            self.local_destroy_blob_by_name(name, blob_id, bucket_id)
                .await?;
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .destroy_blob_by_name(proto::DestroyBlobByNameRequest {
                    name: name.to_string(),
                    blob_id: blob_id.to_bits(),
                    bucket_id: bucket_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
        }
        self.remove_blob_from_bucket_info(bucket_id, blob_id).await
    }

    /// The blob-owner-side half of [`Self::destroy_blob_by_name`].
    pub async fn local_destroy_blob_by_name(
        &self,
        name: &str,
        blob_id: BlobId,
        bucket_id: BucketId,
    ) -> Result<()> {
        debug!(name, ?blob_id, "destroying blob");
        if !blob_id.in_swap() {
            let buffer_ids = self.storage.buffer_id_list(blob_id.buffer_ids_offset())?;
            io::release_buffers(&self.pool, &self.rpc, &buffer_ids).await?;
        }
        // Swap regions are not reclaimed; the directory entry alone goes.
        self.storage.free_buffer_id_list(blob_id.buffer_ids_offset())?;
        let internal = make_internal_blob_name(name, bucket_id);
        self.delete_id(&internal, MapKind::Blob).await
    }

    /// Destroy a blob by id, recovering its name from the reverse map.
    pub async fn destroy_blob_by_id(&self, blob_id: BlobId, bucket_id: BucketId) -> Result<()> {
        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            self.local_destroy_blob_by_id(blob_id, bucket_id).await
        } else {
            let mut client = self.rpc.metadata(target).await?;
            client
                .destroy_blob_by_id(proto::DestroyBlobByIdRequest {
                    blob_id: blob_id.to_bits(),
                    bucket_id: bucket_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?;
            Ok(())
        }
    }

    /// The blob-owner-side half of [`Self::destroy_blob_by_id`].
    pub async fn local_destroy_blob_by_id(
        &self,
        blob_id: BlobId,
        _bucket_id: BucketId,
    ) -> Result<()> {
        if !blob_id.in_swap() {
            let buffer_ids = self.storage.buffer_id_list(blob_id.buffer_ids_offset())?;
            io::release_buffers(&self.pool, &self.rpc, &buffer_ids).await?;
        }
        self.storage.free_buffer_id_list(blob_id.buffer_ids_offset())?;

        match self.storage.local_reverse_get(blob_id.to_bits(), MapKind::Blob) {
            Some(internal) => self.delete_id(&internal, MapKind::Blob).await,
            None => {
                debug!(?blob_id, "expected blob id in map but found none");
                Ok(())
            }
        }
    }

    /// Rename a blob within its bucket: same id, new directory key. The
    /// old name must exist.
    pub async fn rename_blob(
        &self,
        bucket_id: BucketId,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        validate_blob_name(new_name)?;
        let blob_id = self.get_blob_id(old_name, bucket_id).await?;
        if blob_id.is_null() {
            return Err(Error::BlobNotFound {
                bucket: format!("{bucket_id:?}"),
                name: old_name.to_string(),
            });
        }

        info!(old_name, new_name, "renaming blob");
        self.delete_id(&make_internal_blob_name(old_name, bucket_id), MapKind::Blob)
            .await?;
        self.put_id(
            &make_internal_blob_name(new_name, bucket_id),
            blob_id.to_bits(),
            MapKind::Blob,
        )
        .await
    }

    /// Whether `name` resolves to a blob that is still a member of
    /// `bucket_id`. Id existence and bucket membership live on different
    /// shards, so both are consulted.
    pub async fn contains_blob(&self, bucket_id: BucketId, name: &str) -> Result<bool> {
        let blob_id = self.get_blob_id(name, bucket_id).await?;
        if blob_id.is_null() {
            return Ok(false);
        }

        let target = bucket_id.node_id();
        if self.rpc.is_local(target) {
            Ok(self.storage.bucket_contains_blob(bucket_id, blob_id))
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .contains_blob(proto::BucketBlobRequest {
                    bucket_id: bucket_id.to_bits(),
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .value)
        }
    }

    /// Whether the named blob was spilled to swap.
    pub async fn blob_is_in_swap(&self, bucket_id: BucketId, name: &str) -> Result<bool> {
        Ok(self.get_blob_id(name, bucket_id).await?.in_swap())
    }

    /// All blob ids registered in a bucket.
    pub async fn get_blob_ids(&self, bucket_id: BucketId) -> Result<Vec<BlobId>> {
        let target = bucket_id.node_id();
        if self.rpc.is_local(target) {
            Ok(self.storage.bucket_blob_ids(bucket_id))
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .get_blob_ids(proto::BucketIdRequest {
                    bucket_id: bucket_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .ids
                .into_iter()
                .map(BlobId::from_bits)
                .collect())
        }
    }

    /// Recover a blob's user-visible name from its id.
    pub async fn get_blob_name_from_id(&self, blob_id: BlobId) -> Result<String> {
        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            Ok(self.local_get_blob_name_from_id(blob_id))
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .get_blob_name_from_id(proto::BlobIdRequest {
                    blob_id: blob_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .name)
        }
    }

    /// The local form of [`Self::get_blob_name_from_id`]; empty when the
    /// id is unknown.
    #[must_use]
    pub fn local_get_blob_name_from_id(&self, blob_id: BlobId) -> String {
        self.storage
            .local_reverse_get(blob_id.to_bits(), MapKind::Blob)
            .map(|internal| external_blob_name(&internal).to_string())
            .unwrap_or_default()
    }

    /// Recover the owning bucket id from a blob id.
    pub async fn get_bucket_id_from_blob_id(&self, blob_id: BlobId) -> Result<BucketId> {
        let target = blob_id.owner_node();
        if self.rpc.is_local(target) {
            self.local_get_bucket_id_from_blob_id(blob_id)
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(BucketId::from_bits(
                client
                    .get_bucket_id_from_blob_id(proto::BlobIdRequest {
                        blob_id: blob_id.to_bits(),
                    })
                    .await
                    .map_err(|status| self.rpc.failed(target, status))?
                    .into_inner()
                    .id,
            ))
        }
    }

    /// The local form of [`Self::get_bucket_id_from_blob_id`].
    pub fn local_get_bucket_id_from_blob_id(&self, blob_id: BlobId) -> Result<BucketId> {
        match self.storage.local_reverse_get(blob_id.to_bits(), MapKind::Blob) {
            Some(internal) => Ok(BucketId::from_bits(hex_prefix_to_u64(&internal)?)),
            None => Ok(BucketId::NULL),
        }
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Placement targets exported by `target_node`.
    pub async fn node_targets(&self, target_node: u32) -> Result<Vec<TargetId>> {
        if self.rpc.is_local(target_node) {
            Ok(hermes_bufpool::local_node_targets(
                self.rpc.node_id(),
                self.pool.num_devices(),
            ))
        } else {
            let mut client = self.rpc.metadata(target_node).await?;
            Ok(client
                .get_node_targets(proto::Empty {})
                .await
                .map_err(|status| self.rpc.failed(target_node, status))?
                .into_inner()
                .ids
                .into_iter()
                .map(TargetId::from_bits)
                .collect())
        }
    }

    /// This node's targets plus those of its ring neighbors (previous and
    /// next node, wrapping).
    pub async fn neighborhood_targets(&self) -> Result<Vec<TargetId>> {
        let mut targets = self.node_targets(self.rpc.node_id()).await?;
        match self.rpc.num_nodes() {
            1 => {}
            2 => {
                targets.extend(self.node_targets(self.rpc.next_node()).await?);
            }
            _ => {
                targets.extend(self.node_targets(self.rpc.next_node()).await?);
                targets.extend(self.node_targets(self.rpc.previous_node()).await?);
            }
        }
        Ok(targets)
    }

    /// Free bytes remaining on a target's device, queried from its owner.
    pub async fn remaining_target_capacity(&self, target_id: TargetId) -> Result<u64> {
        let target = target_id.node_id();
        if self.rpc.is_local(target) {
            Ok(self.pool.remaining_capacity(target_id.device_id()))
        } else {
            let mut client = self.rpc.metadata(target).await?;
            Ok(client
                .get_remaining_target_capacity(proto::TargetIdRequest {
                    target_id: target_id.to_bits(),
                })
                .await
                .map_err(|status| self.rpc.failed(target, status))?
                .into_inner()
                .bytes)
        }
    }

    // ------------------------------------------------------------------
    // Blob put/get orchestration
    // ------------------------------------------------------------------

    /// Place a blob per `schema`, write it, and bind it into the bucket.
    /// An existing blob of the same name is destroyed first so the new
    /// bytes fully replace it. `PoolExhausted` leaves no state behind;
    /// the caller may retry with another schema or spill via
    /// [`Self::put_swap_blob`].
    pub async fn put_blob(
        &self,
        bucket_id: BucketId,
        name: &str,
        data: &Bytes,
        schema: &PlacementSchema,
    ) -> Result<BlobId> {
        validate_blob_name(name)?;
        let requested: u64 = schema.iter().map(|entry| entry.bytes).sum();
        if data.is_empty() && requested > 0 {
            return Err(Error::InvalidBlob);
        }

        if self.contains_blob(bucket_id, name).await? {
            self.destroy_blob_by_name(bucket_id, name).await?;
        }

        let buffer_ids = io::get_buffers(&self.pool, &self.rpc, schema).await?;
        let written = io::write_blob_to_buffers(&self.pool, &self.rpc, data, &buffer_ids).await?;
        if written < data.len() as u64 {
            io::release_buffers(&self.pool, &self.rpc, &buffer_ids).await?;
            return Err(Error::storage(format!(
                "schema holds {written} of {} blob bytes",
                data.len()
            )));
        }

        self.attach_blob_to_bucket(name, bucket_id, &buffer_ids, false)
            .await
    }

    /// Spill a blob to this node's swap file and bind it with a negated
    /// node id. The fallback when no tier can absorb the bytes.
    pub async fn put_swap_blob(
        &self,
        bucket_id: BucketId,
        name: &str,
        data: &Bytes,
    ) -> Result<BlobId> {
        validate_blob_name(name)?;
        warn!(name, size = data.len(), "placing blob in swap");

        if self.contains_blob(bucket_id, name).await? {
            self.destroy_blob_by_name(bucket_id, name).await?;
        }

        let record = self.swap.append(data, bucket_id)?;
        self.attach_blob_to_bucket(name, bucket_id, &record.to_buffer_ids(), true)
            .await
    }

    /// Read a blob back, from its buffers or from swap.
    pub async fn get_blob(&self, bucket_id: BucketId, name: &str) -> Result<Bytes> {
        let blob_id = self.get_blob_id(name, bucket_id).await?;
        if blob_id.is_null() {
            return Err(Error::BlobNotFound {
                bucket: format!("{bucket_id:?}"),
                name: name.to_string(),
            });
        }
        self.read_blob_by_id(blob_id).await
    }

    /// Read a blob's bytes given its id.
    pub async fn read_blob_by_id(&self, blob_id: BlobId) -> Result<Bytes> {
        let buffer_ids = self.get_buffer_id_list(blob_id).await?;
        if blob_id.in_swap() {
            let record = SwapBlob::from_buffer_ids(&buffer_ids)?;
            read_swap_blob(&self.swap_config, &record)
        } else {
            io::read_blob_from_buffers(&self.pool, &self.rpc, &buffer_ids).await
        }
    }

    /// Total bytes a named blob holds.
    pub async fn get_blob_size(&self, bucket_id: BucketId, name: &str) -> Result<u64> {
        let blob_id = self.get_blob_id(name, bucket_id).await?;
        if blob_id.is_null() {
            return Ok(0);
        }
        let buffer_ids = self.get_buffer_id_list(blob_id).await?;
        if blob_id.in_swap() {
            Ok(SwapBlob::from_buffer_ids(&buffer_ids)?.size)
        } else {
            let mut total = 0;
            for id in buffer_ids {
                total += io::get_buffer_size(&self.pool, &self.rpc, id).await?;
            }
            Ok(total)
        }
    }
}

impl std::fmt::Debug for MetadataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataManager")
            .field("node_id", &self.rpc.node_id())
            .finish()
    }
}
