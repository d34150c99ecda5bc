//! Identifier and schema types.
//!
//! Every Hermes identifier is a 64-bit value with a split view: the high
//! 32 bits name the owning node, the low 32 bits are an index or offset
//! that only the owner knows how to resolve. Zero is the null id for every
//! kind, and the home node of any id is computable without consulting a
//! directory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum bucket name length in bytes. Names of `MAX - 1` bytes are the
/// longest accepted.
pub const MAX_BUCKET_NAME_LEN: usize = 256;

/// Maximum vbucket name length in bytes.
pub const MAX_VBUCKET_NAME_LEN: usize = 256;

/// Maximum blob name length in bytes (excluding the internal bucket-id
/// prefix).
pub const MAX_BLOB_NAME_LEN: usize = 64;

/// Length of the hex-encoded bucket id that prefixes internal blob names:
/// two characters per byte of the 64-bit id.
pub const BUCKET_ID_HEX_LEN: usize = 2 * std::mem::size_of::<u64>();

/// Number of trait slots carried by each vbucket.
pub const MAX_TRAITS_PER_VBUCKET: usize = 8;

/// Number of `BufferId` entries a swap-blob record packs into.
pub const SWAP_BLOB_FIELDS: usize = 4;

/// The node that holds the authoritative global system view state.
pub const GLOBAL_SYSTEM_VIEW_NODE: u32 = 1;

const fn pack(node_id: u32, low: u32) -> u64 {
    ((node_id as u64) << 32) | low as u64
}

/// Identifies one allocatable buffer: owning node in the high bits, index
/// into that node's buffer-header array in the low bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BufferId(u64);

impl BufferId {
    /// The null buffer id.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(node_id: u32, header_index: u32) -> Self {
        Self(pack(node_id, header_index))
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// The node that owns this buffer.
    #[must_use]
    pub const fn node_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Index into the owner's buffer-header array.
    #[must_use]
    pub const fn header_index(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({}.{})", self.node_id(), self.header_index())
    }
}

/// Identifies a bucket: owning node in the high bits, slot index into the
/// owner's bucket-info table in the low bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BucketId(u64);

impl BucketId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn node_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Slot index into the owner's bucket-info table.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({}.{})", self.node_id(), self.index())
    }
}

/// Identifies a vbucket; layout mirrors [`BucketId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VBucketId(u64);

impl VBucketId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn node_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for VBucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VBucketId({}.{})", self.node_id(), self.index())
    }
}

/// Identifies a blob. The high 32 bits are a *signed* node id; a negative
/// value means the blob's bytes live in the owner's swap file rather than
/// in buffers. The low 32 bits are an offset into the owner's
/// buffer-id-list heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlobId(u64);

impl BlobId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(node_id: i32, buffer_ids_offset: u32) -> Self {
        Self(pack(node_id as u32, buffer_ids_offset))
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// The signed node field; negative when the blob is in swap.
    #[must_use]
    pub const fn node_id(self) -> i32 {
        (self.0 >> 32) as i32
    }

    /// The node that owns this blob's buffer-id list, regardless of swap
    /// status.
    #[must_use]
    pub const fn owner_node(self) -> u32 {
        self.node_id().unsigned_abs()
    }

    /// Offset into the owner's buffer-id-list heap.
    #[must_use]
    pub const fn buffer_ids_offset(self) -> u32 {
        self.0 as u32
    }

    /// True when the blob's bytes were spilled to the swap file.
    #[must_use]
    pub const fn in_swap(self) -> bool {
        self.node_id() < 0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlobId({}.{}{})",
            self.node_id(),
            self.buffer_ids_offset(),
            if self.in_swap() { " swap" } else { "" }
        )
    }
}

/// A placement destination: (node, device). Devices are numbered by tier
/// index on their node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TargetId(u64);

impl TargetId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(node_id: u32, device_id: u32) -> Self {
        Self(pack(node_id, device_id))
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn node_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub const fn device_id(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({}.{})", self.node_id(), self.device_id())
    }
}

/// One slice of a placement decision: put `bytes` on `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub target: TargetId,
    pub bytes: u64,
}

impl SchemaEntry {
    #[must_use]
    pub const fn new(target: TargetId, bytes: u64) -> Self {
        Self { target, bytes }
    }
}

/// An ordered list of placement slices produced by a placement policy.
pub type PlacementSchema = Vec<SchemaEntry>;

/// Record describing a blob that was spilled to a node's swap file.
///
/// The record packs into exactly [`SWAP_BLOB_FIELDS`] `BufferId` slots so
/// it can be stored in the ordinary buffer-id-list heap and bound to a
/// `BlobId` with a negated node field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapBlob {
    /// Node whose swap file holds the bytes.
    pub node_id: u32,
    /// Byte offset of the blob within the swap file.
    pub offset: u64,
    /// Blob size in bytes.
    pub size: u64,
    /// The bucket the blob belongs to.
    pub bucket_id: BucketId,
}

impl SwapBlob {
    /// Pack the record into a 4-entry buffer-id list.
    #[must_use]
    pub fn to_buffer_ids(self) -> Vec<BufferId> {
        vec![
            BufferId::from_bits(u64::from(self.node_id)),
            BufferId::from_bits(self.offset),
            BufferId::from_bits(self.size),
            BufferId::from_bits(self.bucket_id.to_bits()),
        ]
    }

    /// Recover the record from a list produced by [`Self::to_buffer_ids`].
    pub fn from_buffer_ids(ids: &[BufferId]) -> Result<Self> {
        if ids.len() != SWAP_BLOB_FIELDS {
            return Err(Error::Storage(format!(
                "swap blob record has {} fields, expected {}",
                ids.len(),
                SWAP_BLOB_FIELDS
            )));
        }

        Ok(Self {
            node_id: ids[0].to_bits() as u32,
            offset: ids[1].to_bits(),
            size: ids[2].to_bits(),
            bucket_id: BucketId::from_bits(ids[3].to_bits()),
        })
    }
}

/// Build the internal directory key for a blob: the bucket id rendered as
/// 16 hex characters (most-significant nibble first) followed by the
/// user-visible name.
///
/// The prefix is hex rather than raw bytes because the id bytes may
/// contain NUL, and hex gives every node the same canonical byte order.
#[must_use]
pub fn make_internal_blob_name(name: &str, bucket_id: BucketId) -> String {
    format!("{:016x}{}", bucket_id.to_bits(), name)
}

/// Strip the bucket-id prefix from an internal blob key, returning the
/// user-visible name. Returns an empty string for keys shorter than the
/// prefix.
#[must_use]
pub fn external_blob_name(internal: &str) -> &str {
    internal.get(BUCKET_ID_HEX_LEN..).unwrap_or("")
}

/// Parse the leading 16 hex characters of an internal blob key back into
/// the bucket id bits.
pub fn hex_prefix_to_u64(internal: &str) -> Result<u64> {
    let prefix = internal
        .get(..BUCKET_ID_HEX_LEN)
        .ok_or_else(|| Error::Storage(format!("internal blob name too short: {internal:?}")))?;
    u64::from_str_radix(prefix, 16)
        .map_err(|_| Error::Storage(format!("malformed bucket id prefix: {prefix:?}")))
}

/// Validate a bucket name's length.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.len() >= MAX_BUCKET_NAME_LEN {
        return Err(Error::BucketNameTooLong {
            len: name.len(),
            max: MAX_BUCKET_NAME_LEN,
        });
    }
    Ok(())
}

/// Validate a vbucket name's length.
pub fn validate_vbucket_name(name: &str) -> Result<()> {
    if name.len() >= MAX_VBUCKET_NAME_LEN {
        return Err(Error::VBucketNameTooLong {
            len: name.len(),
            max: MAX_VBUCKET_NAME_LEN,
        });
    }
    Ok(())
}

/// Validate a blob name's length.
pub fn validate_blob_name(name: &str) -> Result<()> {
    if name.len() >= MAX_BLOB_NAME_LEN {
        return Err(Error::BlobNameTooLong {
            len: name.len(),
            max: MAX_BLOB_NAME_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_packing() {
        let id = BufferId::new(3, 17);
        assert_eq!(id.node_id(), 3);
        assert_eq!(id.header_index(), 17);
        assert!(!id.is_null());
        assert!(BufferId::NULL.is_null());
    }

    #[test]
    fn test_blob_id_swap_sign() {
        let normal = BlobId::new(2, 40);
        assert_eq!(normal.node_id(), 2);
        assert_eq!(normal.owner_node(), 2);
        assert!(!normal.in_swap());

        let swapped = BlobId::new(-2, 40);
        assert_eq!(swapped.node_id(), -2);
        assert_eq!(swapped.owner_node(), 2);
        assert_eq!(swapped.buffer_ids_offset(), 40);
        assert!(swapped.in_swap());
    }

    #[test]
    fn test_internal_blob_name_roundtrip() {
        let bucket = BucketId::new(7, 42);
        let internal = make_internal_blob_name("weights.dat", bucket);
        assert_eq!(internal.len(), BUCKET_ID_HEX_LEN + "weights.dat".len());
        assert_eq!(external_blob_name(&internal), "weights.dat");
        assert_eq!(hex_prefix_to_u64(&internal).unwrap(), bucket.to_bits());
    }

    #[test]
    fn test_hex_prefix_is_canonical() {
        // The prefix must render most-significant nibble first so that all
        // nodes agree on the key bytes.
        let bucket = BucketId::from_bits(0x0102_0304_0506_0708);
        let internal = make_internal_blob_name("x", bucket);
        assert!(internal.starts_with("0102030405060708"));
    }

    #[test]
    fn test_swap_blob_roundtrip() {
        let swap = SwapBlob {
            node_id: 4,
            offset: 8192,
            size: 100,
            bucket_id: BucketId::new(1, 9),
        };
        let ids = swap.to_buffer_ids();
        assert_eq!(ids.len(), SWAP_BLOB_FIELDS);
        assert_eq!(SwapBlob::from_buffer_ids(&ids).unwrap(), swap);

        assert!(SwapBlob::from_buffer_ids(&ids[..3]).is_err());
    }

    #[test]
    fn test_name_length_boundaries() {
        let longest = "b".repeat(MAX_BUCKET_NAME_LEN - 1);
        assert!(validate_bucket_name(&longest).is_ok());
        let too_long = "b".repeat(MAX_BUCKET_NAME_LEN);
        assert!(validate_bucket_name(&too_long).is_err());

        assert!(validate_blob_name(&"k".repeat(MAX_BLOB_NAME_LEN - 1)).is_ok());
        assert!(validate_blob_name(&"k".repeat(MAX_BLOB_NAME_LEN)).is_err());
    }
}
