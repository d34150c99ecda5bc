//! Hermes Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for Hermes' internal
//! gRPC services. Every public Metadata Manager and Buffer Pool operation
//! has exactly one rpc here; the remote form of an operation is
//! behaviorally identical to its local form.

/// Metadata service (directory, refcounts, system view state)
pub mod metadata {
    tonic::include_proto!("hermes.metadata");
}

/// Buffer service (buffer allocation, release and I/O)
pub mod buffer {
    tonic::include_proto!("hermes.buffer");
}
