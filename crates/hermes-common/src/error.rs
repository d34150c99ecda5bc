//! Error types shared across the Hermes crates.

use thiserror::Error;

/// Common result type for Hermes operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Hermes.
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors: returned to the caller, no state change.
    #[error("bucket name is {len} bytes, exceeds the maximum of {max}")]
    BucketNameTooLong { len: usize, max: usize },

    #[error("vbucket name is {len} bytes, exceeds the maximum of {max}")]
    VBucketNameTooLong { len: usize, max: usize },

    #[error("blob name is {len} bytes, exceeds the maximum of {max}")]
    BlobNameTooLong { len: usize, max: usize },

    #[error("blob data is null but size is non-zero")]
    InvalidBlob,

    // Lifecycle errors.
    #[error("bucket '{0}' still has open references")]
    BucketInUse(String),

    #[error("blob not found: {bucket}/{name}")]
    BlobNotFound { bucket: String, name: String },

    // Capacity errors: returned; the placement engine may retry with a
    // different schema.
    #[error("buffer pool cannot satisfy the requested schema")]
    PoolExhausted,

    #[error("no free {0} slots on this node; increase max_{0}s_per_node")]
    SlotExhausted(&'static str),

    // Structural errors. Arena exhaustion is unrecoverable for the segment
    // that hit it; the advice names the knob to turn.
    #[error("{region} arena capacity exceeded; increase {advice} in the configuration")]
    ArenaExhausted {
        region: &'static str,
        advice: &'static str,
    },

    #[error("{0} map is full; increase the metadata memory allotment")]
    MapFull(&'static str),

    // Transport errors: shared-memory state on both ends is unchanged
    // because each op commits atomically under its mutex.
    #[error("rpc to node {node} failed: {message}")]
    Rpc { node: u32, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an rpc failure for the given target node.
    pub fn rpc(node: u32, message: impl Into<String>) -> Self {
        Self::Rpc {
            node,
            message: message.into(),
        }
    }

    /// True for capacity shortfalls the placement engine may retry around.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::SlotExhausted(_))
    }

    /// True for name-validation rejections.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BucketNameTooLong { .. }
                | Self::VBucketNameTooLong { .. }
                | Self::BlobNameTooLong { .. }
                | Self::InvalidBlob
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::PoolExhausted.is_capacity());
        assert!(Error::SlotExhausted("bucket").is_capacity());
        assert!(!Error::InvalidBlob.is_capacity());

        assert!(Error::InvalidBlob.is_validation());
        assert!(!Error::PoolExhausted.is_validation());
    }

    #[test]
    fn test_error_messages_name_the_knob() {
        let err = Error::ArenaExhausted {
            region: "metadata",
            advice: "metadata_memory_percent",
        };
        assert!(err.to_string().contains("metadata_memory_percent"));

        let err = Error::SlotExhausted("bucket");
        assert!(err.to_string().contains("max_buckets_per_node"));
    }
}
