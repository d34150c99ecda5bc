//! Configuration types for the Hermes core.
//!
//! These structures shape the shared-memory segment, the buffer pool's
//! slab classes, the metadata directory's slot pools, and the RPC layer.
//! Parsing a configuration *file* belongs to the daemon; this crate only
//! defines the structures and their validation rules.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// How far the sum of a percentage set may drift from 1.0 before the
/// configuration is rejected.
const PERCENT_EPSILON: f32 = 1e-3;

/// Root configuration for one Hermes node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// This node's id. Node ids are 1-based.
    pub node_id: u32,
    /// Total number of nodes in the installation.
    pub num_nodes: u32,
    /// The buffering tiers, fastest first by convention.
    pub tiers: Vec<TierConfig>,
    /// Carve-up of the shared-memory segment.
    pub memory: MemoryConfig,
    /// Directory slot pool sizes.
    pub directory: DirectoryConfig,
    /// RPC addressing.
    pub rpc: RpcConfig,
    /// Swap spill file placement.
    pub swap: SwapConfig,
    /// Base name for the shared-memory segment; the effective name appends
    /// the OS user name.
    pub shmem_name: String,
    /// Total size of the shared-memory segment in bytes.
    pub shmem_capacity: u64,
    /// Cadence of the global system-view reconciliation push.
    pub system_view_state_update_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            num_nodes: 1,
            tiers: vec![TierConfig::ram(128 * 1024 * 1024)],
            memory: MemoryConfig::default(),
            directory: DirectoryConfig::default(),
            rpc: RpcConfig::default(),
            swap: SwapConfig::default(),
            shmem_name: "hermes_buffer_pool_".to_string(),
            shmem_capacity: 256 * 1024 * 1024,
            system_view_state_update_interval_ms: 100,
        }
    }
}

impl Config {
    /// Validate cross-field consistency. Called once at init; violations
    /// are configuration errors surfaced to the user.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 || self.node_id > self.num_nodes {
            return Err(Error::config(format!(
                "node_id {} out of range 1..={}",
                self.node_id, self.num_nodes
            )));
        }
        if self.tiers.is_empty() {
            return Err(Error::config("at least one tier is required"));
        }
        self.memory.validate()?;
        for (i, tier) in self.tiers.iter().enumerate() {
            tier.validate(i)?;
        }
        if self.rpc.node_addresses.len() != self.num_nodes as usize {
            return Err(Error::config(format!(
                "rpc.node_addresses has {} entries for {} nodes",
                self.rpc.node_addresses.len(),
                self.num_nodes
            )));
        }
        Ok(())
    }

    /// The number of devices (== tiers) on this node.
    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.tiers.len()
    }
}

/// Description of one buffering tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Total bytes the tier may buffer.
    pub capacity: u64,
    /// The smallest addressable unit of the tier.
    pub block_size: u32,
    /// Slab classes, each a multiple of the block size. Ascending.
    pub slab_unit_sizes: Vec<u32>,
    /// How the tier's capacity is split across the slab classes; must sum
    /// to 1.0.
    pub desired_slab_percentages: Vec<f32>,
    /// Theoretical bandwidth in MiB/s. Placement-policy input only.
    pub bandwidth_mbps: f32,
    /// Theoretical latency in microseconds. Placement-policy input only.
    pub latency_us: f32,
    /// Directory for buffering files; empty for a RAM tier.
    pub mount_point: String,
}

impl TierConfig {
    /// A RAM tier with the default 4 KiB block and 1/4/16/64-block slabs.
    #[must_use]
    pub fn ram(capacity: u64) -> Self {
        Self {
            capacity,
            block_size: 4096,
            slab_unit_sizes: vec![1, 4, 16, 64],
            desired_slab_percentages: vec![0.25, 0.25, 0.25, 0.25],
            bandwidth_mbps: 6000.0,
            latency_us: 0.1,
            mount_point: String::new(),
        }
    }

    /// A file-backed tier under `mount_point`.
    #[must_use]
    pub fn file_backed(capacity: u64, mount_point: impl Into<String>) -> Self {
        Self {
            capacity,
            block_size: 4096,
            slab_unit_sizes: vec![4, 16, 64, 256],
            desired_slab_percentages: vec![0.25, 0.25, 0.25, 0.25],
            bandwidth_mbps: 300.0,
            latency_us: 200.0,
            mount_point: mount_point.into(),
        }
    }

    /// True when the tier buffers in byte-addressable shared memory.
    #[must_use]
    pub fn is_ram(&self) -> bool {
        self.mount_point.is_empty()
    }

    /// Number of slab classes.
    #[must_use]
    pub fn num_slabs(&self) -> usize {
        self.slab_unit_sizes.len()
    }

    /// Buffer size in bytes of slab class `slab`.
    #[must_use]
    pub fn slab_buffer_size(&self, slab: usize) -> u64 {
        u64::from(self.slab_unit_sizes[slab]) * u64::from(self.block_size)
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.slab_unit_sizes.is_empty() {
            return Err(Error::config(format!(
                "tier {index} declares no slab classes"
            )));
        }
        if self.slab_unit_sizes.len() != self.desired_slab_percentages.len() {
            return Err(Error::config(format!(
                "tier {index}: {} slab sizes but {} percentages",
                self.slab_unit_sizes.len(),
                self.desired_slab_percentages.len()
            )));
        }
        if !self.slab_unit_sizes.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::config(format!(
                "tier {index}: slab unit sizes must be strictly ascending"
            )));
        }
        let sum: f32 = self.desired_slab_percentages.iter().sum();
        if (sum - 1.0).abs() > PERCENT_EPSILON {
            return Err(Error::config(format!(
                "tier {index}: slab percentages sum to {sum}, expected 1.0"
            )));
        }
        Ok(())
    }
}

/// Carve-up of the shared-memory segment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction for RAM buffering (headers + data).
    pub buffer_pool_percent: f32,
    /// Fraction for the metadata directory.
    pub metadata_percent: f32,
    /// Fraction reserved as scratch for inter-tier transfers.
    pub transfer_window_percent: f32,
    /// Fraction for transient per-call scratch.
    pub transient_percent: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            buffer_pool_percent: 0.85,
            metadata_percent: 0.04,
            transfer_window_percent: 0.08,
            transient_percent: 0.03,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<()> {
        let sum = self.buffer_pool_percent
            + self.metadata_percent
            + self.transfer_window_percent
            + self.transient_percent;
        if (sum - 1.0).abs() > PERCENT_EPSILON {
            return Err(Error::config(format!(
                "memory percentages sum to {sum}, expected 1.0"
            )));
        }
        Ok(())
    }
}

/// Directory slot pool sizes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Bucket slots per node.
    pub max_buckets_per_node: u32,
    /// VBucket slots per node.
    pub max_vbuckets_per_node: u32,
    /// Sizes the blob directory map; blobs beyond this count on one node
    /// are a configuration error.
    pub max_blobs_per_node: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_buckets_per_node: 256,
            max_vbuckets_per_node: 256,
            max_blobs_per_node: 16384,
        }
    }
}

/// RPC addressing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Listen address for this node's RPC server.
    pub listen: String,
    /// gRPC endpoint of every node, indexed by `node_id - 1`.
    pub node_addresses: Vec<String>,
    /// Handler worker threads.
    pub num_worker_threads: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9400".to_string(),
            node_addresses: vec!["http://127.0.0.1:9400".to_string()],
            num_worker_threads: 4,
        }
    }
}

/// Swap spill file placement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Directory the swap file lives in.
    pub mount_point: String,
    /// Filename prefix; the node id is appended between prefix and suffix.
    pub filename_prefix: String,
    /// Filename suffix.
    pub filename_suffix: String,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            mount_point: "/tmp".to_string(),
            filename_prefix: "hermes_swap_".to_string(),
            filename_suffix: ".dat".to_string(),
        }
    }
}

impl SwapConfig {
    /// Path of the swap file for `node_id`.
    #[must_use]
    pub fn swap_file_path(&self, node_id: u32) -> std::path::PathBuf {
        std::path::Path::new(&self.mount_point).join(format!(
            "{}{}{}",
            self.filename_prefix, node_id, self.filename_suffix
        ))
    }
}

/// Construct the effective shared-memory name by appending the OS user
/// name, so concurrent users on one machine get distinct segments.
#[must_use]
pub fn full_shmem_name(base: &str) -> String {
    let user = std::env::var("USER").unwrap_or_default();
    format!("{base}{user}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_bad_slab_percentages_rejected() {
        let mut config = Config::default();
        config.tiers[0].desired_slab_percentages = vec![0.5, 0.5, 0.5, 0.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slab_sizes_must_ascend() {
        let mut config = Config::default();
        config.tiers[0].slab_unit_sizes = vec![4, 1, 16, 64];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_id_range() {
        let mut config = Config::default();
        config.node_id = 2;
        assert!(config.validate().is_err());

        config.num_nodes = 2;
        config.rpc.node_addresses = vec![
            "http://127.0.0.1:9400".to_string(),
            "http://127.0.0.1:9401".to_string(),
        ];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_swap_file_path() {
        let swap = SwapConfig::default();
        let path = swap.swap_file_path(3);
        assert_eq!(path, std::path::PathBuf::from("/tmp/hermes_swap_3.dat"));
    }

    #[test]
    fn test_full_shmem_name_appends_user() {
        let name = full_shmem_name("hermes_");
        assert!(name.starts_with("hermes_"));
    }
}
