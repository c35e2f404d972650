//! Wire envelopes and the closed control-command set

use super::serde_safe::{
    BoundedBytes, BoundedVec, MAX_CHUNK_BYTES, MAX_PAYLOAD_BYTES, MAX_PROXY_ARG_BYTES, MAX_TOPICS,
    MAX_VISITED,
};
use crate::types::{now_millis, Address};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type aliases for bounded wire collections
pub type Visited = BoundedVec<Address, MAX_VISITED>;
pub type Topics = BoundedVec<String, MAX_TOPICS>;
pub type Payload = BoundedBytes<MAX_PAYLOAD_BYTES>;
pub type ChunkData = BoundedBytes<MAX_CHUNK_BYTES>;
pub type ProxyArgs = BoundedBytes<MAX_PROXY_ARG_BYTES>;

/// Handshake announcement: who the peer is and what it subscribes to.
/// `paired` requests immediate pairing on all overlapping topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPairedPayload {
    pub address: Address,
    pub subscriptions: Topics,
    pub paired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    /// The node originally asking for a pairing partner.
    pub previous_node: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub file_id: Uuid,
    pub filename: String,
    pub index: u64,
    pub total_chunks: u64,
    pub chunk_size: u32,
    /// Total file size in bytes.
    pub size: u64,
    /// SHA-256 of `data`, verified on receipt.
    pub sha256: [u8; 32],
    pub eof: bool,
    pub data: ChunkData,
}

/// X.509 subject attributes carried in certificate requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequestPayload {
    pub subject: SubjectAttributes,
    /// Requester IP, included as a SAN entry in the issued certificate.
    pub ip: String,
    /// When absent the CA generates the key and CSR on the requester's
    /// behalf and returns the private key alongside the certificate.
    pub csr_pem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CertificateOutcome {
    Issued {
        serial: u64,
        cert_pem: String,
        key_pem: Option<String>,
        root_pem: String,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCallPayload {
    pub module_path: String,
    pub attr_path: String,
    pub args: ProxyArgs,
    pub kwargs: ProxyArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyOutcome {
    Ok(ProxyArgs),
    Err { kind: String, reason: String },
}

/// The closed control-command set. Unknown tags fail postcard decode and
/// surface as a protocol error at the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ReportPaired(ReportPairedPayload),
    Keepalive { sent_at: i64 },
    KeepaliveResponse { sent_at: i64 },
    Discovery(DiscoveryPayload),
    Pairing,
    PairDeclined,
    Unpair,
    TopicMessage(Payload),
    FileChunk(FileChunkPayload),
    FileResumeFrom { file_id: Uuid, index: u64 },
    FileTransferFailed { file_id: Uuid, reason: String },
    FileBusy { file_id: Uuid },
    FlowPause { file_id: Uuid },
    FlowResume { file_id: Uuid },
    CaRequestCertificate(CertificateRequestPayload),
    CaRequestCertificateResponse(CertificateOutcome),
    CaRevoke { serial: u64 },
    CaGetCrl,
    CaGetCrlResponse { crl_pem: String },
    ProxyCall(ProxyCallPayload),
    ProxyCallResponse(ProxyOutcome),
    TooManyEdges,
    Terminate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReportPaired(_) => "report_paired",
            Command::Keepalive { .. } => "keepalive",
            Command::KeepaliveResponse { .. } => "keepalive_response",
            Command::Discovery(_) => "discovery",
            Command::Pairing => "pairing",
            Command::PairDeclined => "pair_declined",
            Command::Unpair => "unpair",
            Command::TopicMessage(_) => "topic_message",
            Command::FileChunk(_) => "file_chunk",
            Command::FileResumeFrom { .. } => "file_resume_from",
            Command::FileTransferFailed { .. } => "file_transfer_failed",
            Command::FileBusy { .. } => "file_busy",
            Command::FlowPause { .. } => "flow_pause",
            Command::FlowResume { .. } => "flow_resume",
            Command::CaRequestCertificate(_) => "ca_request_certificate",
            Command::CaRequestCertificateResponse(_) => "ca_request_certificate_response",
            Command::CaRevoke { .. } => "ca_revoke",
            Command::CaGetCrl => "ca_get_crl",
            Command::CaGetCrlResponse { .. } => "ca_get_crl_response",
            Command::ProxyCall(_) => "proxy_call",
            Command::ProxyCallResponse(_) => "proxy_call_response",
            Command::TooManyEdges => "too_many_edges",
            Command::Terminate => "terminate",
        }
    }

    /// Commands resolved through the pending-request table by envelope id.
    pub fn is_correlated_response(&self) -> bool {
        matches!(
            self,
            Command::CaRequestCertificateResponse(_)
                | Command::CaGetCrlResponse { .. }
                | Command::ProxyCallResponse(_)
        )
    }

    /// Commands a peer may send before the `report_paired` exchange completes.
    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(
            self,
            Command::ReportPaired(_) | Command::TooManyEdges | Command::Terminate
        )
    }

    /// Per-command post-decode size cap. Tighter than the frame limit so a
    /// small command cannot smuggle a huge frame.
    pub fn max_size(&self) -> usize {
        match self {
            Command::ReportPaired(_) => 64 * 1024,
            Command::Keepalive { .. } | Command::KeepaliveResponse { .. } => 256,
            Command::Discovery(_) => 32 * 1024,
            Command::Pairing | Command::PairDeclined | Command::Unpair => 1024,
            Command::TopicMessage(_) => MAX_PAYLOAD_BYTES + 1024,
            Command::FileChunk(_) => MAX_CHUNK_BYTES + 4096,
            Command::FileResumeFrom { .. }
            | Command::FileBusy { .. }
            | Command::FlowPause { .. }
            | Command::FlowResume { .. } => 256,
            Command::FileTransferFailed { .. } => 4096,
            Command::CaRequestCertificate(_) => 64 * 1024,
            Command::CaRequestCertificateResponse(_) => 256 * 1024,
            Command::CaRevoke { .. } => 256,
            Command::CaGetCrl => 128,
            Command::CaGetCrlResponse { .. } => 1024 * 1024,
            Command::ProxyCall(_) => 2 * MAX_PROXY_ARG_BYTES + 4096,
            Command::ProxyCallResponse(_) => MAX_PROXY_ARG_BYTES + 4096,
            Command::TooManyEdges | Command::Terminate => 128,
        }
    }
}

/// The unit of on-wire communication.
///
/// `id` correlates requests with responses and deduplicates discovery
/// floods; it is unique within the origin. `ttl` and `visited` are only
/// meaningful for `discovery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub origin: Address,
    /// Origin UTC milliseconds.
    pub timestamp: i64,
    pub ttl: u32,
    pub visited: Visited,
    pub topic: Option<String>,
    pub command: Command,
}

impl Envelope {
    pub fn new(origin: Address, command: Command) -> Self {
        Self {
            id: rand::random(),
            origin,
            timestamp: now_millis(),
            ttl: 0,
            visited: Visited::default(),
            topic: None,
            command,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build a reply carrying the same correlation id.
    pub fn reply(&self, origin: Address, command: Command) -> Self {
        Self {
            id: self.id,
            origin,
            timestamp: now_millis(),
            ttl: 0,
            visited: Visited::default(),
            topic: self.topic.clone(),
            command,
        }
    }
}
