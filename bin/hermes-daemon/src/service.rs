//! gRPC service implementations.
//!
//! Each handler is the remote form of one public core operation: it
//! decodes the ids, runs the `local_*` form against this node's shared
//! memory, and maps the workspace error onto a grpc status. Behavior is
//! identical to the local form by construction.

use hermes_common::{BlobId, BucketId, BufferId, Error, SchemaEntry, TargetId, VBucketId};
use hermes_meta::{sysview, MapKind, MetadataManager};
use hermes_proto::buffer::{self, buffer_service_server::BufferService};
use hermes_proto::metadata::{self, metadata_service_server::MetadataService};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Serves both the metadata and the buffer service for one node.
#[derive(Clone)]
pub struct HermesService {
    mdm: Arc<MetadataManager>,
}

impl HermesService {
    #[must_use]
    pub fn new(mdm: Arc<MetadataManager>) -> Self {
        Self { mdm }
    }
}

fn to_status(err: Error) -> Status {
    match &err {
        Error::PoolExhausted | Error::SlotExhausted(_) | Error::MapFull(_) => {
            Status::resource_exhausted(err.to_string())
        }
        Error::BucketInUse(_) => Status::failed_precondition(err.to_string()),
        Error::BlobNotFound { .. } => Status::not_found(err.to_string()),
        _ if err.is_validation() => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn decode_map(map: i32) -> Result<MapKind, Status> {
    match metadata::MapKind::try_from(map) {
        Ok(metadata::MapKind::Bucket) => Ok(MapKind::Bucket),
        Ok(metadata::MapKind::Vbucket) => Ok(MapKind::VBucket),
        Ok(metadata::MapKind::Blob) => Ok(MapKind::Blob),
        _ => Err(Status::invalid_argument("unspecified map kind")),
    }
}

#[tonic::async_trait]
impl MetadataService for HermesService {
    async fn get(
        &self,
        request: Request<metadata::GetRequest>,
    ) -> Result<Response<metadata::IdResponse>, Status> {
        let req = request.into_inner();
        let id = self.mdm.storage().local_get(&req.key, decode_map(req.map)?);
        Ok(Response::new(metadata::IdResponse { id }))
    }

    async fn put(
        &self,
        request: Request<metadata::PutRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .local_put(&req.key, req.id, decode_map(req.map)?)
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn delete(
        &self,
        request: Request<metadata::DeleteRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm.storage().local_delete(&req.key, decode_map(req.map)?);
        Ok(Response::new(metadata::Empty {}))
    }

    async fn get_or_create_bucket_id(
        &self,
        request: Request<metadata::NameRequest>,
    ) -> Result<Response<metadata::IdResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .mdm
            .local_get_or_create_bucket_id(&req.name)
            .map_err(to_status)?;
        Ok(Response::new(metadata::IdResponse { id: id.to_bits() }))
    }

    async fn get_or_create_v_bucket_id(
        &self,
        request: Request<metadata::NameRequest>,
    ) -> Result<Response<metadata::IdResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .mdm
            .local_get_or_create_vbucket_id(&req.name)
            .map_err(to_status)?;
        Ok(Response::new(metadata::IdResponse { id: id.to_bits() }))
    }

    async fn destroy_bucket(
        &self,
        request: Request<metadata::DestroyBucketRequest>,
    ) -> Result<Response<metadata::BoolResponse>, Status> {
        let req = request.into_inner();
        match self
            .mdm
            .local_destroy_bucket(&req.name, BucketId::from_bits(req.bucket_id))
            .await
        {
            Ok(()) => Ok(Response::new(metadata::BoolResponse { value: true })),
            Err(Error::BucketInUse(name)) => {
                debug!(name, "remote destroy refused");
                Ok(Response::new(metadata::BoolResponse { value: false }))
            }
            Err(err) => Err(to_status(err)),
        }
    }

    async fn destroy_v_bucket(
        &self,
        request: Request<metadata::DestroyVBucketRequest>,
    ) -> Result<Response<metadata::BoolResponse>, Status> {
        let req = request.into_inner();
        match self
            .mdm
            .local_destroy_vbucket(&req.name, VBucketId::from_bits(req.vbucket_id))
            .await
        {
            Ok(()) => Ok(Response::new(metadata::BoolResponse { value: true })),
            Err(Error::BucketInUse(_)) => Ok(Response::new(metadata::BoolResponse { value: false })),
            Err(err) => Err(to_status(err)),
        }
    }

    async fn rename_bucket(
        &self,
        request: Request<metadata::RenameBucketRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .local_rename_bucket(
                BucketId::from_bits(req.bucket_id),
                &req.old_name,
                &req.new_name,
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn increment_refcount(
        &self,
        request: Request<metadata::BucketIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .incr_bucket_refcount(BucketId::from_bits(req.bucket_id));
        Ok(Response::new(metadata::Empty {}))
    }

    async fn decrement_refcount(
        &self,
        request: Request<metadata::BucketIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .decr_bucket_refcount(BucketId::from_bits(req.bucket_id));
        Ok(Response::new(metadata::Empty {}))
    }

    async fn increment_refcount_v_bucket(
        &self,
        request: Request<metadata::VBucketIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .incr_vbucket_refcount(VBucketId::from_bits(req.vbucket_id));
        Ok(Response::new(metadata::Empty {}))
    }

    async fn decrement_refcount_v_bucket(
        &self,
        request: Request<metadata::VBucketIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .decr_vbucket_refcount(VBucketId::from_bits(req.vbucket_id));
        Ok(Response::new(metadata::Empty {}))
    }

    async fn allocate_buffer_id_list(
        &self,
        request: Request<metadata::AllocateBufferIdListRequest>,
    ) -> Result<Response<metadata::OffsetResponse>, Status> {
        let req = request.into_inner();
        let ids: Vec<BufferId> = req.buffer_ids.into_iter().map(BufferId::from_bits).collect();
        let offset = self
            .mdm
            .storage()
            .alloc_buffer_id_list(&ids)
            .map_err(to_status)?;
        Ok(Response::new(metadata::OffsetResponse { offset }))
    }

    async fn get_buffer_id_list(
        &self,
        request: Request<metadata::BlobIdRequest>,
    ) -> Result<Response<metadata::BufferIdListResponse>, Status> {
        let req = request.into_inner();
        let blob_id = BlobId::from_bits(req.blob_id);
        let ids = self
            .mdm
            .storage()
            .buffer_id_list(blob_id.buffer_ids_offset())
            .map_err(to_status)?;
        Ok(Response::new(metadata::BufferIdListResponse {
            buffer_ids: ids.iter().map(|id| id.to_bits()).collect(),
        }))
    }

    async fn free_buffer_id_list(
        &self,
        request: Request<metadata::BlobIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        let blob_id = BlobId::from_bits(req.blob_id);
        self.mdm
            .storage()
            .free_buffer_id_list(blob_id.buffer_ids_offset())
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn add_blob_id_to_bucket(
        &self,
        request: Request<metadata::BucketBlobRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .append_blob_to_bucket(
                BucketId::from_bits(req.bucket_id),
                BlobId::from_bits(req.blob_id),
            )
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn add_blob_id_to_v_bucket(
        &self,
        request: Request<metadata::VBucketBlobRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .storage()
            .append_blob_to_vbucket(
                VBucketId::from_bits(req.vbucket_id),
                BlobId::from_bits(req.blob_id),
            )
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn remove_blob_from_bucket_info(
        &self,
        request: Request<metadata::BucketBlobRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm.storage().remove_blob_from_bucket(
            BucketId::from_bits(req.bucket_id),
            BlobId::from_bits(req.blob_id),
        );
        Ok(Response::new(metadata::Empty {}))
    }

    async fn destroy_blob_by_name(
        &self,
        request: Request<metadata::DestroyBlobByNameRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .local_destroy_blob_by_name(
                &req.name,
                BlobId::from_bits(req.blob_id),
                BucketId::from_bits(req.bucket_id),
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn destroy_blob_by_id(
        &self,
        request: Request<metadata::DestroyBlobByIdRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        self.mdm
            .local_destroy_blob_by_id(
                BlobId::from_bits(req.blob_id),
                BucketId::from_bits(req.bucket_id),
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }

    async fn contains_blob(
        &self,
        request: Request<metadata::BucketBlobRequest>,
    ) -> Result<Response<metadata::BoolResponse>, Status> {
        let req = request.into_inner();
        let value = self.mdm.storage().bucket_contains_blob(
            BucketId::from_bits(req.bucket_id),
            BlobId::from_bits(req.blob_id),
        );
        Ok(Response::new(metadata::BoolResponse { value }))
    }

    async fn get_blob_ids(
        &self,
        request: Request<metadata::BucketIdRequest>,
    ) -> Result<Response<metadata::IdListResponse>, Status> {
        let req = request.into_inner();
        let ids = self
            .mdm
            .storage()
            .bucket_blob_ids(BucketId::from_bits(req.bucket_id));
        Ok(Response::new(metadata::IdListResponse {
            ids: ids.iter().map(|id| id.to_bits()).collect(),
        }))
    }

    async fn get_blob_name_from_id(
        &self,
        request: Request<metadata::BlobIdRequest>,
    ) -> Result<Response<metadata::NameResponse>, Status> {
        let req = request.into_inner();
        let name = self
            .mdm
            .local_get_blob_name_from_id(BlobId::from_bits(req.blob_id));
        Ok(Response::new(metadata::NameResponse { name }))
    }

    async fn get_bucket_id_from_blob_id(
        &self,
        request: Request<metadata::BlobIdRequest>,
    ) -> Result<Response<metadata::IdResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .mdm
            .local_get_bucket_id_from_blob_id(BlobId::from_bits(req.blob_id))
            .map_err(to_status)?;
        Ok(Response::new(metadata::IdResponse { id: id.to_bits() }))
    }

    async fn get_node_targets(
        &self,
        _request: Request<metadata::Empty>,
    ) -> Result<Response<metadata::IdListResponse>, Status> {
        let targets = hermes_bufpool::local_node_targets(
            self.mdm.rpc().node_id(),
            self.mdm.pool().num_devices(),
        );
        Ok(Response::new(metadata::IdListResponse {
            ids: targets.iter().map(|t| t.to_bits()).collect(),
        }))
    }

    async fn get_remaining_target_capacity(
        &self,
        request: Request<metadata::TargetIdRequest>,
    ) -> Result<Response<metadata::CapacityResponse>, Status> {
        let req = request.into_inner();
        let target = TargetId::from_bits(req.target_id);
        let bytes = self.mdm.pool().remaining_capacity(target.device_id());
        Ok(Response::new(metadata::CapacityResponse { bytes }))
    }

    async fn get_global_device_capacities(
        &self,
        _request: Request<metadata::Empty>,
    ) -> Result<Response<metadata::CapacitiesResponse>, Status> {
        let global = self
            .mdm
            .storage()
            .global_sysview()
            .ok_or_else(|| Status::failed_precondition("not the global system view node"))?;
        Ok(Response::new(metadata::CapacitiesResponse {
            bytes_available: global.to_vec(),
        }))
    }

    async fn update_global_system_view_state(
        &self,
        request: Request<metadata::AdjustmentsRequest>,
    ) -> Result<Response<metadata::Empty>, Status> {
        let req = request.into_inner();
        sysview::local_update_global_sysview(self.mdm.storage(), &req.adjustments)
            .map_err(to_status)?;
        Ok(Response::new(metadata::Empty {}))
    }
}

#[tonic::async_trait]
impl BufferService for HermesService {
    async fn get_buffers(
        &self,
        request: Request<buffer::GetBuffersRequest>,
    ) -> Result<Response<buffer::BufferIdListResponse>, Status> {
        let req = request.into_inner();
        let node_id = self.mdm.rpc().node_id();
        let entries: Vec<SchemaEntry> = req
            .schema
            .iter()
            .map(|entry| SchemaEntry::new(TargetId::from_bits(entry.target_id), entry.bytes))
            .collect();
        if entries.iter().any(|entry| entry.target.node_id() != node_id) {
            return Err(Status::invalid_argument(
                "schema slice targets another node",
            ));
        }

        let ids = self
            .mdm
            .pool()
            .local_get_buffers(&entries)
            .map_err(to_status)?;
        Ok(Response::new(buffer::BufferIdListResponse {
            buffer_ids: ids.iter().map(|id| id.to_bits()).collect(),
        }))
    }

    async fn release_buffers(
        &self,
        request: Request<buffer::ReleaseBuffersRequest>,
    ) -> Result<Response<buffer::Empty>, Status> {
        let req = request.into_inner();
        let ids: Vec<BufferId> = req.buffer_ids.into_iter().map(BufferId::from_bits).collect();
        self.mdm
            .pool()
            .local_release_buffers(&ids)
            .map_err(to_status)?;
        Ok(Response::new(buffer::Empty {}))
    }

    async fn get_buffer_size(
        &self,
        request: Request<buffer::BufferIdRequest>,
    ) -> Result<Response<buffer::SizeResponse>, Status> {
        let req = request.into_inner();
        let bytes = self
            .mdm
            .pool()
            .local_buffer_size(BufferId::from_bits(req.buffer_id))
            .map_err(to_status)?;
        Ok(Response::new(buffer::SizeResponse { bytes }))
    }

    async fn write_buffer(
        &self,
        request: Request<buffer::WriteBufferRequest>,
    ) -> Result<Response<buffer::SizeResponse>, Status> {
        let req = request.into_inner();
        let bytes = self
            .mdm
            .pool()
            .local_write_buffer(BufferId::from_bits(req.buffer_id), &req.data)
            .map_err(to_status)?;
        Ok(Response::new(buffer::SizeResponse { bytes }))
    }

    async fn read_buffer(
        &self,
        request: Request<buffer::BufferIdRequest>,
    ) -> Result<Response<buffer::DataResponse>, Status> {
        let req = request.into_inner();
        let data = self
            .mdm
            .pool()
            .local_read_buffer(BufferId::from_bits(req.buffer_id))
            .map_err(to_status)?;
        Ok(Response::new(buffer::DataResponse {
            data: data.to_vec(),
        }))
    }
}
