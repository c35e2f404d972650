//! Protocol constants and node configuration.
//!
//! Every collection and frame that crosses the wire has an explicit size
//! limit; a peer cannot exhaust memory by sending large or many envelopes.
//! Timeouts here are defaults — all of them are configurable per node
//! through [`NodeConfig`].

use crate::net::transfer::FileDelivery;
use crate::types::NodeClass;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// FRAMING
// =============================================================================

/// Maximum wire frame (length prefix excluded). Frames above this are a
/// protocol error and close the edge.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// =============================================================================
// EDGE LIFECYCLE
// =============================================================================

/// Maximum live edges per node. Inbound connections beyond this receive
/// `too_many_edges` and are closed.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Interval between keepalive probes on every edge.
pub const LATENCY_UPDATE_SECS: u64 = 60;

/// An unanswered keepalive older than this declares the edge dead.
pub const KEEPALIVE_TIMEOUT_SECS: u64 = 14;

/// Time allowed for the `report_paired` exchange on a fresh connection.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Envelopes queued per edge writer before `send` applies backpressure.
pub const EDGE_WRITE_QUEUE: usize = 256;

// =============================================================================
// RECONNECTION
// =============================================================================
// Only explicitly connected peers are reconnected; discovered peers are
// re-found by the next discovery round instead.

/// First reconnect delay after an unexpected edge loss.
pub const RECONNECT_BASE_DELAY_SECS: u64 = 1;

/// Reconnect delay cap.
pub const RECONNECT_MAX_DELAY_SECS: u64 = 30;

/// Exponential backoff factor: 1s, 2s, 4s, ... capped at 30s.
pub const RECONNECT_BACKOFF_FACTOR: u64 = 2;

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// Correlated request timeout; the pending slot is removed on expiry.
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// DISCOVERY & PAIRING
// =============================================================================

/// Hops a discovery envelope may travel.
pub const DEFAULT_DISCOVERY_TTL: u32 = 64;

/// Interval between discovery rounds for unpaired topics.
pub const DISCOVERY_INTERVAL_SECS: u64 = 30;

/// Window during which late `pairing` responders are still accepted.
pub const PAIRING_TIMEOUT_SECS: u64 = 5;

/// A (topic, peer) pairing with no traffic for this long may be unpaired.
pub const PAIRING_IDLE_TIMEOUT_SECS: u64 = 600;

/// Entries in the (origin, envelope id) dedupe cache.
/// 64k entries keep several minutes of flood history on a busy mesh.
pub const SEEN_CACHE_CAPACITY: usize = 65_536;

// =============================================================================
// STREAMING
// =============================================================================

/// Delivery queue capacity. Overflow drops the oldest message and
/// increments the overflow counter — lossy by design.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// FILE TRANSFER
// =============================================================================

/// Default chunk payload size.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Active inbound file records; excess offers get `file_busy`.
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 8;

/// Out-of-order chunks buffered per file, in units of `chunk_size`.
/// Beyond this the receiver sends `flow_pause`.
pub const OUT_OF_ORDER_CHUNK_BUDGET: u64 = 32;

/// Re-requests of a corrupt chunk before the transfer is aborted.
pub const CHUNK_RETRY_LIMIT: u8 = 3;

/// An inbound file record idle for this long is dropped; its `.part`
/// stays on disk for a future resume.
pub const FILE_IDLE_TIMEOUT_SECS: u64 = 30;

/// How often idle file records are swept.
pub const FILE_SWEEP_INTERVAL_SECS: u64 = 5;

// =============================================================================
// PROXY
// =============================================================================

/// In-flight `proxy_call` executions per node.
pub const PROXY_MAX_IN_FLIGHT: usize = 32;

/// Callback invoked when an inbound file completes.
pub type FileCallback = Arc<dyn Fn(FileDelivery) + Send + Sync>;

/// Node runtime configuration. `..Default::default()` covers everything a
/// test or embedder does not care about.
#[derive(Clone)]
pub struct NodeConfig {
    pub class: NodeClass,
    /// Listen IP. The canonical address advertises this verbatim.
    pub ip: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub subscriptions: Vec<String>,
    pub max_connections: usize,
    /// Reconnect attempts for explicitly connected peers; `None` = infinite.
    pub reconnections: Option<u32>,
    pub discovery_ttl: u32,
    pub discovery_interval: Duration,
    pub latency_update: Duration,
    pub keepalive_timeout: Duration,
    pub request_timeout: Duration,
    pub pairing_timeout: Duration,
    pub pairing_idle_timeout: Duration,
    pub file_idle_timeout: Duration,
    pub chunk_size: u32,
    pub max_concurrent_files: usize,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    /// Where inbound files land.
    pub destination_folder: PathBuf,
    /// TLS material directory (`node.key`, `node.crt`, `ca.crt`, `crl.pem`).
    /// `Some` enables mutual TLS on every edge.
    pub ssl_location: Option<PathBuf>,
    /// Module paths the proxy layer will serve. Empty = proxy disabled.
    pub allowed_modules: Vec<String>,
    pub file_handling_callback: Option<FileCallback>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            class: NodeClass::Node,
            ip: "127.0.0.1".to_string(),
            port: 0,
            subscriptions: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reconnections: Some(8),
            discovery_ttl: DEFAULT_DISCOVERY_TTL,
            discovery_interval: Duration::from_secs(DISCOVERY_INTERVAL_SECS),
            latency_update: Duration::from_secs(LATENCY_UPDATE_SECS),
            keepalive_timeout: Duration::from_secs(KEEPALIVE_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            pairing_timeout: Duration::from_secs(PAIRING_TIMEOUT_SECS),
            pairing_idle_timeout: Duration::from_secs(PAIRING_IDLE_TIMEOUT_SECS),
            file_idle_timeout: Duration::from_secs(FILE_IDLE_TIMEOUT_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            destination_folder: PathBuf::from("."),
            ssl_location: None,
            allowed_modules: Vec::new(),
            file_handling_callback: None,
        }
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("class", &self.class)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("subscriptions", &self.subscriptions)
            .field("max_connections", &self.max_connections)
            .field("reconnections", &self.reconnections)
            .field("ssl", &self.ssl_location.is_some())
            .finish_non_exhaustive()
    }
}
