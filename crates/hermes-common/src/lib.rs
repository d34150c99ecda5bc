//! Common types for the Hermes buffering core.
//!
//! This crate holds everything the other Hermes crates agree on: packed
//! 64-bit identifiers whose bits carry their owning node, the placement
//! schema handed down by placement policies, the workspace error type, and
//! the configuration structures that shape the buffer pool and the
//! metadata directory.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DirectoryConfig, MemoryConfig, RpcConfig, SwapConfig, TierConfig};
pub use error::{Error, Result};
pub use types::{
    external_blob_name, hex_prefix_to_u64, make_internal_blob_name, validate_blob_name,
    validate_bucket_name, validate_vbucket_name, BlobId, BucketId, BufferId, PlacementSchema,
    SchemaEntry, SwapBlob, TargetId, VBucketId, BUCKET_ID_HEX_LEN, GLOBAL_SYSTEM_VIEW_NODE,
    MAX_BLOB_NAME_LEN, MAX_BUCKET_NAME_LEN, MAX_TRAITS_PER_VBUCKET, MAX_VBUCKET_NAME_LEN,
    SWAP_BLOB_FIELDS,
};
