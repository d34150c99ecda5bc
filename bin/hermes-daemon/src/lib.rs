//! Library half of the Hermes daemon: the gRPC service implementations
//! and node assembly, reusable by the binary and by multi-node tests.

pub mod node;
pub mod service;

pub use node::HermesNode;
pub use service::HermesService;
