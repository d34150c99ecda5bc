//! Blob I/O onto buffer lists, and the remote form of pool operations.
//!
//! Every function here takes the local pool plus the rpc context and
//! dispatches per buffer: buffers owned by this node go straight to
//! shared memory or the slab files, buffers owned elsewhere go over the
//! buffer service to their owner, which performs the identical local
//! operation. Four access variants fall out of the dispatch: local RAM,
//! local file, remote RAM and remote file; the remote pair differs only
//! in where the owner's header points.

use crate::pool::BufferPool;
use bytes::{Bytes, BytesMut};
use hermes_common::{BufferId, PlacementSchema, Result, SchemaEntry};
use hermes_proto::buffer as proto;
use hermes_rpc::RpcContext;
use std::collections::BTreeMap;
use tracing::debug;

fn schema_entry_to_proto(entry: &SchemaEntry) -> proto::SchemaEntry {
    proto::SchemaEntry {
        target_id: entry.target.to_bits(),
        bytes: entry.bytes,
    }
}

/// Satisfy a placement schema, entry by entry and in order, so the
/// returned id list lines up with the schema for the subsequent write.
/// All-or-nothing across the whole schema: a shortfall anywhere returns
/// every provisionally acquired buffer, local and remote, and yields
/// `PoolExhausted` (or the transport error that interrupted the attempt).
pub async fn get_buffers(
    pool: &BufferPool,
    rpc: &RpcContext,
    schema: &PlacementSchema,
) -> Result<Vec<BufferId>> {
    let mut acquired: Vec<BufferId> = Vec::new();

    for entry in schema {
        let node = entry.target.node_id();
        let result = if rpc.is_local(node) {
            pool.local_get_buffers(std::slice::from_ref(entry))
        } else {
            remote_get_buffers(rpc, node, entry).await
        };

        match result {
            Ok(ids) => acquired.extend(ids),
            Err(err) => {
                debug!(?entry, %err, "schema slice failed, rolling back");
                release_buffers(pool, rpc, &acquired).await?;
                return Err(err);
            }
        }
    }

    Ok(acquired)
}

async fn remote_get_buffers(
    rpc: &RpcContext,
    node: u32,
    entry: &SchemaEntry,
) -> Result<Vec<BufferId>> {
    let mut client = rpc.buffer(node).await?;
    let response = client
        .get_buffers(proto::GetBuffersRequest {
            schema: vec![schema_entry_to_proto(entry)],
        })
        .await
        .map_err(|status| {
            // The owner reports a shortfall as resource exhaustion; that
            // is the same PoolExhausted the local path yields.
            if status.code() == tonic::Code::ResourceExhausted {
                hermes_common::Error::PoolExhausted
            } else {
                rpc.failed(node, status)
            }
        })?;
    Ok(response
        .into_inner()
        .buffer_ids
        .into_iter()
        .map(BufferId::from_bits)
        .collect())
}

/// Return buffers to their owners' free lists, batching one rpc per
/// remote node.
pub async fn release_buffers(
    pool: &BufferPool,
    rpc: &RpcContext,
    ids: &[BufferId],
) -> Result<()> {
    let mut by_node: BTreeMap<u32, Vec<BufferId>> = BTreeMap::new();
    for &id in ids {
        by_node.entry(id.node_id()).or_default().push(id);
    }

    for (node, ids) in by_node {
        if rpc.is_local(node) {
            pool.local_release_buffers(&ids)?;
        } else {
            let mut client = rpc.buffer(node).await?;
            client
                .release_buffers(proto::ReleaseBuffersRequest {
                    buffer_ids: ids.iter().map(|id| id.to_bits()).collect(),
                })
                .await
                .map_err(|status| rpc.failed(node, status))?;
        }
    }
    Ok(())
}

/// Split a blob across its buffer list in order. Each buffer receives at
/// most its capacity; remote buffers receive the remaining bytes and
/// report how many they kept. Returns the bytes placed, which is short of
/// `blob.len()` only if the list cannot hold the blob.
pub async fn write_blob_to_buffers(
    pool: &BufferPool,
    rpc: &RpcContext,
    blob: &Bytes,
    ids: &[BufferId],
) -> Result<u64> {
    let mut offset = 0usize;
    for &id in ids {
        if offset >= blob.len() {
            break;
        }
        let node = id.node_id();
        let chunk = &blob[offset..];
        let written = if rpc.is_local(node) {
            pool.local_write_buffer(id, chunk)?
        } else {
            let mut client = rpc.buffer(node).await?;
            client
                .write_buffer(proto::WriteBufferRequest {
                    buffer_id: id.to_bits(),
                    data: chunk.to_vec(),
                })
                .await
                .map_err(|status| rpc.failed(node, status))?
                .into_inner()
                .bytes
        };
        offset += written as usize;
    }
    Ok(offset as u64)
}

/// Gather a blob back from its buffer list in order. Returns the
/// concatenated bytes; the total read is the sum of each buffer's used
/// count.
pub async fn read_blob_from_buffers(
    pool: &BufferPool,
    rpc: &RpcContext,
    ids: &[BufferId],
) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for &id in ids {
        let node = id.node_id();
        if rpc.is_local(node) {
            out.extend_from_slice(&pool.local_read_buffer(id)?);
        } else {
            let mut client = rpc.buffer(node).await?;
            let data = client
                .read_buffer(proto::BufferIdRequest {
                    buffer_id: id.to_bits(),
                })
                .await
                .map_err(|status| rpc.failed(node, status))?
                .into_inner()
                .data;
            out.extend_from_slice(&data);
        }
    }
    Ok(out.freeze())
}

/// Bytes of real data held by one buffer, wherever it lives.
pub async fn get_buffer_size(pool: &BufferPool, rpc: &RpcContext, id: BufferId) -> Result<u64> {
    let node = id.node_id();
    if rpc.is_local(node) {
        pool.local_buffer_size(id)
    } else {
        let mut client = rpc.buffer(node).await?;
        Ok(client
            .get_buffer_size(proto::BufferIdRequest {
                buffer_id: id.to_bits(),
            })
            .await
            .map_err(|status| rpc.failed(node, status))?
            .into_inner()
            .bytes)
    }
}
