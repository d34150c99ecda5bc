//! RPC context for Hermes nodes.
//!
//! Every public core operation that may touch another node's state goes
//! through an [`RpcContext`]: it knows this node's identity, the gRPC
//! endpoint of every peer, and hands out lazily-connected clients for the
//! metadata and buffer services. Channels are cached per node and shared
//! by all clients cloned from them.

use hermes_common::{Error, Result};
use hermes_proto::buffer::buffer_service_client::BufferServiceClient;
use hermes_proto::metadata::metadata_service_client::MetadataServiceClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Node identity plus the client side of the Hermes wire protocol.
pub struct RpcContext {
    node_id: u32,
    /// gRPC endpoint of every node, indexed by `node_id - 1`.
    addresses: Vec<String>,
    channels: Mutex<HashMap<u32, Channel>>,
}

impl RpcContext {
    /// Create a context for `node_id` (1-based) in an installation whose
    /// nodes listen at `addresses` (indexed by `node_id - 1`).
    pub fn new(node_id: u32, addresses: Vec<String>) -> Result<Self> {
        if node_id == 0 || node_id as usize > addresses.len() {
            return Err(Error::config(format!(
                "node_id {} out of range for {} addresses",
                node_id,
                addresses.len()
            )));
        }
        Ok(Self {
            node_id,
            addresses,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Number of nodes in the installation.
    #[must_use]
    pub fn num_nodes(&self) -> u32 {
        self.addresses.len() as u32
    }

    /// True when `node` is this node.
    #[must_use]
    pub fn is_local(&self, node: u32) -> bool {
        node == self.node_id
    }

    /// The next node on the ring, wrapping from the last node to node 1.
    #[must_use]
    pub fn next_node(&self) -> u32 {
        if self.node_id == self.num_nodes() {
            1
        } else {
            self.node_id + 1
        }
    }

    /// The previous node on the ring, wrapping from node 1 to the last.
    #[must_use]
    pub fn previous_node(&self) -> u32 {
        if self.node_id == 1 {
            self.num_nodes()
        } else {
            self.node_id - 1
        }
    }

    /// A metadata-service client for `node`.
    pub async fn metadata(&self, node: u32) -> Result<MetadataServiceClient<Channel>> {
        Ok(MetadataServiceClient::new(self.channel(node).await?))
    }

    /// A buffer-service client for `node`.
    pub async fn buffer(&self, node: u32) -> Result<BufferServiceClient<Channel>> {
        Ok(BufferServiceClient::new(self.channel(node).await?))
    }

    /// Translate a transport-level failure into the workspace error.
    #[must_use]
    pub fn failed(&self, node: u32, status: tonic::Status) -> Error {
        Error::rpc(node, status.to_string())
    }

    async fn channel(&self, node: u32) -> Result<Channel> {
        if let Some(channel) = self.channels.lock().get(&node).cloned() {
            return Ok(channel);
        }

        let address = self
            .addresses
            .get(node as usize - 1)
            .ok_or_else(|| Error::config(format!("no address configured for node {node}")))?
            .clone();

        debug!(node, %address, "connecting");
        let endpoint = Endpoint::from_shared(address)
            .map_err(|e| Error::rpc(node, e.to_string()))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::rpc(node, e.to_string()))?;

        self.channels.lock().insert(node, channel.clone());
        Ok(channel)
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("node_id", &self.node_id)
            .field("num_nodes", &self.num_nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(node_id: u32, num_nodes: u32) -> RpcContext {
        let addresses = (0..num_nodes)
            .map(|i| format!("http://127.0.0.1:{}", 9400 + i))
            .collect();
        RpcContext::new(node_id, addresses).unwrap()
    }

    #[test]
    fn test_ring_wraps() {
        let first = context(1, 3);
        assert_eq!(first.next_node(), 2);
        assert_eq!(first.previous_node(), 3);

        let last = context(3, 3);
        assert_eq!(last.next_node(), 1);
        assert_eq!(last.previous_node(), 2);
    }

    #[test]
    fn test_single_node_ring_is_self() {
        let only = context(1, 1);
        assert_eq!(only.next_node(), 1);
        assert_eq!(only.previous_node(), 1);
    }

    #[test]
    fn test_node_id_must_have_address() {
        assert!(RpcContext::new(2, vec!["http://127.0.0.1:9400".into()]).is_err());
        assert!(RpcContext::new(0, vec!["http://127.0.0.1:9400".into()]).is_err());
    }
}
