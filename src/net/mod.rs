//! Node runtime: framed transport, edges, discovery, streaming, transfer.

pub mod codec;
pub mod discovery;
pub mod edge;
pub mod envelope;
pub mod node;
pub mod serde_safe;
pub mod streaming;
pub mod transfer;
pub mod types;

// Re-exports
pub use codec::{decode, encode, CodecError, FrameReader, FrameWriter};
pub use discovery::{PairingTable, SeenCache};
pub use edge::Edge;
pub use envelope::{
    CertificateOutcome, CertificateRequestPayload, Command, DiscoveryPayload, Envelope,
    FileChunkPayload, Payload, ProxyCallPayload, ProxyOutcome, ReportPairedPayload,
    SubjectAttributes, Topics, Visited,
};
pub use node::{Node, NodeError, RetryState};
pub use serde_safe::{
    from_bytes, to_bytes, BoundedBytes, BoundedVec, MAX_CHUNK_BYTES, MAX_PAYLOAD_BYTES,
    MAX_PROXY_ARG_BYTES, MAX_TOPICS, MAX_VISITED,
};
pub use streaming::{DeliveryQueue, Session, TopicMessage};
pub use transfer::FileDelivery;
pub use types::*;
