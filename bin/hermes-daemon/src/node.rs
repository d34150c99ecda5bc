//! Assembly of one Hermes node: shared segment, buffer pool, metadata
//! storage, swap file and rpc context, wired into a metadata manager.

use crate::service::HermesService;
use hermes_bufpool::{BufferPool, SwapManager};
use hermes_common::{Config, Result};
use hermes_meta::{sysview, MetaStorage, MetadataManager};
use hermes_rpc::RpcContext;
use hermes_shmem::Segment;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One fully-assembled Hermes node.
pub struct HermesNode {
    manager: Arc<MetadataManager>,
}

impl HermesNode {
    /// Create the shared segment at `segment_path` and initialize every
    /// core structure in it. This is the Hermes core path; application
    /// processes attach to the segment afterwards.
    pub fn bootstrap(config: &Config, segment_path: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;

        let segment = Arc::new(Segment::create(
            segment_path,
            config.shmem_capacity,
            &config.memory,
        )?);
        let pool = Arc::new(BufferPool::init(segment.clone(), config)?);
        let storage = MetaStorage::init(segment, config, &pool.device_capacities())?;
        let swap = SwapManager::open(&config.swap, config.node_id)?;
        let rpc = Arc::new(RpcContext::new(
            config.node_id,
            config.rpc.node_addresses.clone(),
        )?);

        info!(node_id = config.node_id, num_nodes = config.num_nodes, "node assembled");
        Ok(Self {
            manager: Arc::new(MetadataManager::new(
                storage,
                pool,
                swap,
                config.swap.clone(),
                rpc,
            )),
        })
    }

    /// The node's metadata manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<MetadataManager> {
        &self.manager
    }

    /// A service handle for registering with a tonic server.
    #[must_use]
    pub fn service(&self) -> HermesService {
        HermesService::new(self.manager.clone())
    }

    /// Start the periodic system-view reconciliation: each tick drains
    /// this node's capacity adjustments and pushes them to the global
    /// node.
    #[must_use]
    pub fn spawn_sysview_loop(&self, interval_ms: u64) -> JoinHandle<()> {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(err) = sysview::update_global_sysview(
                    manager.storage(),
                    manager.pool(),
                    manager.rpc(),
                )
                .await
                {
                    warn!(%err, "system view reconciliation failed");
                }
            }
        })
    }
}
