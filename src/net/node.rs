//! Node core: listener, edge set, dispatcher, correlated requests, lifecycle.
//!
//! The node owns every edge. Each accepted or dialed connection completes a
//! `report_paired` exchange before anything else; the peer's declared
//! address keys the edge map, and at most one edge exists per address.
//! Every envelope a reader decodes lands in [`Node::handle_envelope`]; no
//! error escapes a read loop — protocol violations close the offending edge
//! and nothing else.

use crate::ca::{CaError, CertificateAuthority};
use crate::net::codec::{BoxedReader, BoxedWriter, CodecError, FrameReader, FrameWriter};
use crate::net::discovery::{self, PairingTable, SeenCache};
use crate::net::edge::{self, Edge};
use crate::net::envelope::{
    CertificateOutcome, CertificateRequestPayload, Command, Envelope, Payload, ProxyArgs,
    ProxyCallPayload, ProxyOutcome, ReportPairedPayload, SubjectAttributes, Topics,
};
use crate::net::streaming::{DeliveryQueue, Session, TopicMessage};
use crate::net::transfer::{self, FileRecord, TransferControl};
use crate::net::types::{
    NodeConfig, EDGE_WRITE_QUEUE, HANDSHAKE_TIMEOUT_SECS, PROXY_MAX_IN_FLIGHT,
    RECONNECT_BACKOFF_FACTOR, RECONNECT_BASE_DELAY_SECS, RECONNECT_MAX_DELAY_SECS,
    SEEN_CACHE_CAPACITY,
};
use crate::proxy::{DenyAllHandler, ProxyHandler, ProxyRegistry};
use crate::tls::{TlsContext, TlsError};
use crate::types::{now_millis, parse_connect, Address, AddressParseError};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Address(#[from] AddressParseError),

    #[error("failed to bind {addr}: {source}")]
    Listen {
        addr: String,
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("node is stopped")]
    Stopped,

    #[error("no edge to {0}")]
    UnknownEdge(Address),

    #[error("edge to {0} is closed")]
    EdgeClosed(Address),

    #[error("peer refused: too many edges")]
    TooManyEdges,

    #[error("payload of {0} bytes exceeds the wire limit")]
    PayloadTooLarge(usize),

    #[error("no paired peers on topic '{0}'")]
    NoPairedPeers(String),

    #[error("file transfer error: {0}")]
    Transfer(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("certificate request rejected: {0}")]
    CertificateRejected(String),

    #[error("proxy call failed ({kind}): {reason}")]
    Proxy { kind: String, reason: String },
}

/// Exponential reconnect backoff: 1s, 2s, 4s, ... capped at 30s.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            delay: Duration::from_secs(RECONNECT_BASE_DELAY_SECS),
        }
    }

    pub fn next_delay(&self) -> Duration {
        self.delay
    }

    pub fn record_failure(&mut self) {
        self.attempts += 1;
        self.delay = (self.delay * RECONNECT_BACKOFF_FACTOR as u32)
            .min(Duration::from_secs(RECONNECT_MAX_DELAY_SECS));
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Node {
    config: NodeConfig,
    address: Address,
    edges: RwLock<HashMap<Address, Edge>>,
    subscriptions: RwLock<HashSet<String>>,
    pairings: Mutex<PairingTable>,
    seen: Mutex<SeenCache>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    delivery: DeliveryQueue,
    transfers_in: tokio::sync::Mutex<HashMap<Uuid, FileRecord>>,
    transfers_out: Mutex<HashMap<(Uuid, Address), mpsc::Sender<TransferControl>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    tls: Option<TlsContext>,
    ca: Option<tokio::sync::Mutex<CertificateAuthority>>,
    proxy: Option<ProxyRegistry>,
}

impl Node {
    /// Bind, spawn the background tasks and return the running node.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        Self::start_with(config, None, None).await
    }

    /// Start with an embedded certificate authority and/or a proxy handler.
    pub async fn start_with(
        config: NodeConfig,
        ca: Option<CertificateAuthority>,
        proxy_handler: Option<Arc<dyn ProxyHandler>>,
    ) -> Result<Arc<Self>, NodeError> {
        let tls = match &config.ssl_location {
            Some(dir) => match TlsContext::from_dir(dir) {
                Ok(ctx) => Some(ctx),
                Err(TlsError::Io { .. }) if !dir.join("node.crt").exists() => {
                    // No certificate yet — run in the clear so the node can
                    // provision itself against the CA, then restart with TLS.
                    warn!(
                        "no TLS material in {}; starting unencrypted (provisioning mode)",
                        dir.display()
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let listener = TcpListener::bind((config.ip.as_str(), config.port))
            .await
            .map_err(|source| NodeError::Listen {
                addr: format!("{}:{}", config.ip, config.port),
                source,
            })?;
        let port = listener.local_addr()?.port();
        let address = Address::new(config.class, config.ip.clone(), port);

        let proxy = if !config.allowed_modules.is_empty() || proxy_handler.is_some() {
            Some(ProxyRegistry::new(
                config.allowed_modules.clone(),
                proxy_handler.unwrap_or_else(|| Arc::new(DenyAllHandler)),
                PROXY_MAX_IN_FLIGHT,
            ))
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let node = Arc::new(Self {
            subscriptions: RwLock::new(config.subscriptions.iter().cloned().collect()),
            delivery: DeliveryQueue::new(config.queue_capacity),
            seen: Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY)),
            pairings: Mutex::new(PairingTable::new()),
            edges: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            transfers_in: tokio::sync::Mutex::new(HashMap::new()),
            transfers_out: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            ca: ca.map(tokio::sync::Mutex::new),
            address,
            config,
            shutdown,
            tls,
            proxy,
        });

        info!(
            "{} listening ({} subscriptions, tls {})",
            node.address,
            node.subscriptions.read().expect("subscriptions poisoned").len(),
            if node.tls.is_some() { "on" } else { "off" },
        );

        node.track_task(tokio::spawn(run_accept(node.clone(), listener)));
        node.track_task(tokio::spawn(discovery::run_ticker(node.clone())));
        node.track_task(tokio::spawn(run_keepalive(node.clone())));
        node.track_task(tokio::spawn(transfer::run_sweeper(node.clone())));
        Ok(node)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Dial a peer. A leading `*` in `target` requests immediate pairing on
    /// all overlapping topics.
    pub async fn connect(self: &Arc<Self>, target: &str) -> Result<Address, NodeError> {
        let (addr, paired) = parse_connect(target)?;
        self.connect_address(addr, paired, true).await
    }

    pub(crate) async fn connect_address(
        self: &Arc<Self>,
        addr: Address,
        paired: bool,
        explicit: bool,
    ) -> Result<Address, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        if addr == self.address {
            return Err(NodeError::Protocol("refusing to connect to self".into()));
        }
        if self.edges_read().contains_key(&addr) {
            if paired {
                self.pair_overlap(&addr);
            }
            return Ok(addr);
        }

        let stream = TcpStream::connect(addr.socket()).await?;
        stream.set_nodelay(true).ok();
        let (reader, writer): (BoxedReader, BoxedWriter) = match &self.tls {
            Some(ctx) => {
                let name = TlsContext::server_name(&addr.host)?;
                let tls_stream =
                    ctx.connector().connect(name, stream).await.map_err(|e| {
                        warn!("audit: TLS handshake with {} refused: {}", addr, e);
                        NodeError::Io(e)
                    })?;
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
        };
        let mut frame_reader = FrameReader::new(reader, self.config.max_frame_bytes);
        let mut frame_writer = FrameWriter::new(writer, self.config.max_frame_bytes);

        // Initiator announces first, then waits for the peer's announcement.
        let hello = Envelope::new(
            self.address.clone(),
            Command::ReportPaired(ReportPairedPayload {
                address: self.address.clone(),
                subscriptions: self.topics_bounded(),
                paired,
            }),
        );
        frame_writer.write_envelope(&hello).await?;

        let env = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            frame_reader.read_envelope(),
        )
        .await
        .map_err(|_| NodeError::Protocol("handshake timed out".into()))??;

        let peer = match env.command {
            Command::ReportPaired(p) => p,
            Command::TooManyEdges => return Err(NodeError::TooManyEdges),
            other => {
                return Err(NodeError::Protocol(format!(
                    "unexpected {} during handshake",
                    other.name()
                )));
            }
        };

        let peer_addr = peer.address.clone();
        let wants_pair = paired || peer.paired;
        let subs: HashSet<String> = peer.subscriptions.iter().cloned().collect();
        self.install_edge(
            peer_addr.clone(),
            frame_reader,
            frame_writer,
            subs,
            false,
            explicit,
            paired,
        )?;
        if wants_pair {
            self.pair_overlap(&peer_addr);
        }
        info!("edge established to {}", peer_addr);
        Ok(peer_addr)
    }

    /// Register the edge and spawn its reader and writer tasks.
    #[allow(clippy::too_many_arguments)]
    fn install_edge(
        self: &Arc<Self>,
        peer: Address,
        reader: FrameReader,
        writer: FrameWriter,
        subscriptions: HashSet<String>,
        inbound: bool,
        explicit: bool,
        explicit_paired: bool,
    ) -> Result<(), NodeError> {
        let rx = {
            let mut edges = self.edges_write();
            if edges.len() >= self.config.max_connections {
                return Err(NodeError::TooManyEdges);
            }
            if edges.contains_key(&peer) {
                return Err(NodeError::Protocol(format!("duplicate edge to {peer}")));
            }
            let (tx, rx) = mpsc::channel(EDGE_WRITE_QUEUE);
            edges.insert(
                peer.clone(),
                Edge::new(
                    peer.clone(),
                    inbound,
                    explicit,
                    explicit_paired,
                    subscriptions,
                    tx,
                ),
            );
            rx
        };

        self.track_task(tokio::spawn(edge::run_writer(peer.clone(), writer, rx)));
        let reader_handle = tokio::spawn(run_reader(self.clone(), peer.clone(), reader));
        if let Some(edge) = self.edges_write().get_mut(&peer) {
            edge.set_reader(reader_handle);
        } else {
            reader_handle.abort();
        }
        Ok(())
    }

    /// Remove an edge; explicitly connected peers get a reconnect task.
    pub(crate) async fn teardown_edge(self: &Arc<Self>, addr: &Address, reason: &str) {
        let Some(edge) = self.edges_write().remove(addr) else {
            return;
        };
        edge.abort_reader();
        let affected = self.pairings().remove_peer(addr);
        info!("edge {} closed ({})", addr, reason);
        if !affected.is_empty() {
            debug!("unpaired {:?} with {}", affected, addr);
        }

        if edge.explicit && !self.is_stopped() {
            let node = self.clone();
            let addr = addr.clone();
            let paired = edge.explicit_paired;
            let handle = tokio::spawn(async move {
                run_reconnect(node, addr, paired).await;
            });
            self.track_task(handle);
        }
    }

    /// Idempotent shutdown: cancel every owned task, close every socket,
    /// drain pending requests (callers observe `Cancelled`) and close the
    /// delivery queue.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} stopping", self.address);
        let _ = self.shutdown.send(true);
        self.delivery.close();
        self.pending.lock().expect("pending poisoned").clear();
        self.transfers_out.lock().expect("transfers poisoned").clear();

        let edges: Vec<Edge> = self
            .edges_write()
            .drain()
            .map(|(_, edge)| edge)
            .collect();
        for edge in &edges {
            edge.abort_reader();
        }
        drop(edges);

        for task in self.tasks.lock().expect("tasks poisoned").drain(..) {
            task.abort();
        }
    }

    // =========================================================================
    // STREAMING
    // =========================================================================

    /// Publish on every edge paired on `topic`. Returns the number of edges
    /// the message was handed to; peer-side delivery is not awaited.
    pub async fn push(&self, topic: &str, payload: &[u8]) -> Result<usize, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        let data =
            Payload::new(payload.to_vec()).ok_or(NodeError::PayloadTooLarge(payload.len()))?;
        let peers = self.pairings().peers(topic);
        if peers.is_empty() {
            return Err(NodeError::NoPairedPeers(topic.to_string()));
        }

        let mut delivered = 0;
        for peer in peers {
            let Some(sender) = self.sender_for(&peer) else {
                continue;
            };
            let env = Envelope::new(
                self.address.clone(),
                Command::TopicMessage(data.clone()),
            )
            .with_topic(topic);
            if sender.send(env).await.is_ok() {
                self.pairings().touch(topic, &peer);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Stream a file to every peer paired on `topic`.
    pub async fn push_file(
        self: &Arc<Self>,
        topic: &str,
        path: impl AsRef<Path>,
    ) -> Result<Uuid, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        transfer::push_file(self, topic, path.as_ref()).await
    }

    /// Wait for the next delivered message; `None` after `stop()`.
    pub async fn recv(&self) -> Option<TopicMessage> {
        self.delivery.recv().await
    }

    pub fn try_recv(&self) -> Option<TopicMessage> {
        self.delivery.try_recv()
    }

    /// Scoped consumer: dropping the session stops the node.
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(self.clone())
    }

    // =========================================================================
    // CORRELATED REQUESTS
    // =========================================================================

    /// Send a request and await the response with the same envelope id.
    pub async fn request(&self, addr: &Address, command: Command) -> Result<Envelope, NodeError> {
        if self.is_stopped() {
            return Err(NodeError::Stopped);
        }
        let env = Envelope::new(self.address.clone(), command);
        let id = env.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending poisoned").insert(id, tx);

        if let Err(e) = self.send_to(addr, env).await {
            self.pending.lock().expect("pending poisoned").remove(&id);
            return Err(e);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(NodeError::Cancelled),
            Err(_) => {
                self.pending.lock().expect("pending poisoned").remove(&id);
                Err(NodeError::RequestTimeout)
            }
        }
    }

    fn resolve_pending(&self, id: u64, env: Envelope) -> bool {
        match self.pending.lock().expect("pending poisoned").remove(&id) {
            Some(slot) => slot.send(env).is_ok(),
            None => false,
        }
    }

    // =========================================================================
    // CA CLIENT
    // =========================================================================

    /// Obtain key, certificate, CA root and CRL from the mesh CA and write
    /// them into `ssl_location`. Returns the issued serial.
    pub async fn request_ssl_certificate(
        self: &Arc<Self>,
        ca_target: &str,
    ) -> Result<u64, NodeError> {
        let dir = self
            .config
            .ssl_location
            .clone()
            .ok_or_else(|| NodeError::Protocol("ssl_location not configured".into()))?;
        let (ca_addr, _) = parse_connect(ca_target)?;
        self.connect_address(ca_addr.clone(), false, false).await?;

        let request = CertificateRequestPayload {
            subject: SubjectAttributes {
                common_name: self.address.to_string(),
                ..crate::ca::default_subject()
            },
            ip: self.config.ip.clone(),
            csr_pem: None,
        };
        let resp = self
            .request(&ca_addr, Command::CaRequestCertificate(request))
            .await?;
        let Command::CaRequestCertificateResponse(outcome) = resp.command else {
            return Err(NodeError::Protocol("malformed CA response".into()));
        };

        match outcome {
            CertificateOutcome::Issued {
                serial,
                cert_pem,
                key_pem,
                root_pem,
            } => {
                let key_pem = key_pem.ok_or_else(|| {
                    NodeError::Protocol("CA response missing private key".into())
                })?;
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(dir.join("node.key"), key_pem).await?;
                tokio::fs::write(dir.join("node.crt"), cert_pem).await?;
                tokio::fs::write(dir.join("ca.crt"), root_pem).await?;
                let crl = self.fetch_crl(&ca_addr).await?;
                tokio::fs::write(dir.join("crl.pem"), crl).await?;
                info!("provisioned TLS material (serial {}) into {}", serial, dir.display());
                Ok(serial)
            }
            CertificateOutcome::Rejected { reason } => {
                Err(NodeError::CertificateRejected(reason))
            }
        }
    }

    /// Fetch the latest CRL; refresh the on-disk copy when TLS is configured.
    pub async fn request_crl(self: &Arc<Self>, ca_target: &str) -> Result<String, NodeError> {
        let (ca_addr, _) = parse_connect(ca_target)?;
        self.connect_address(ca_addr.clone(), false, false).await?;
        let crl = self.fetch_crl(&ca_addr).await?;
        if let Some(dir) = &self.config.ssl_location {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(dir.join("crl.pem"), &crl).await?;
        }
        Ok(crl)
    }

    async fn fetch_crl(&self, ca_addr: &Address) -> Result<String, NodeError> {
        let resp = self.request(ca_addr, Command::CaGetCrl).await?;
        match resp.command {
            Command::CaGetCrlResponse { crl_pem } => Ok(crl_pem),
            _ => Err(NodeError::Protocol("malformed CRL response".into())),
        }
    }

    /// Ask the CA to revoke a serial. Fire-and-forget; confirm by fetching
    /// the CRL.
    pub async fn revoke_certificate(
        self: &Arc<Self>,
        ca_target: &str,
        serial: u64,
    ) -> Result<(), NodeError> {
        let (ca_addr, _) = parse_connect(ca_target)?;
        self.connect_address(ca_addr.clone(), false, false).await?;
        self.send_to(
            &ca_addr,
            Envelope::new(self.address.clone(), Command::CaRevoke { serial }),
        )
        .await
    }

    // =========================================================================
    // PROXY CLIENT
    // =========================================================================

    pub async fn proxy_call(
        &self,
        addr: &Address,
        module_path: &str,
        attr_path: &str,
        args: Vec<u8>,
        kwargs: Vec<u8>,
    ) -> Result<Vec<u8>, NodeError> {
        let args_len = args.len();
        let kwargs_len = kwargs.len();
        let payload = ProxyCallPayload {
            module_path: module_path.to_string(),
            attr_path: attr_path.to_string(),
            args: ProxyArgs::new(args).ok_or(NodeError::PayloadTooLarge(args_len))?,
            kwargs: ProxyArgs::new(kwargs).ok_or(NodeError::PayloadTooLarge(kwargs_len))?,
        };
        let resp = self.request(addr, Command::ProxyCall(payload)).await?;
        match resp.command {
            Command::ProxyCallResponse(ProxyOutcome::Ok(bytes)) => Ok(bytes.into_inner()),
            Command::ProxyCallResponse(ProxyOutcome::Err { kind, reason }) => {
                Err(NodeError::Proxy { kind, reason })
            }
            _ => Err(NodeError::Protocol("malformed proxy response".into())),
        }
    }

    /// Ask a peer to shut down (the `chaski terminate` verb).
    pub async fn terminate_peer(self: &Arc<Self>, target: &str) -> Result<(), NodeError> {
        let (addr, _) = parse_connect(target)?;
        self.connect_address(addr.clone(), false, false).await?;
        self.send_to(
            &addr,
            Envelope::new(self.address.clone(), Command::Terminate),
        )
        .await
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    pub(crate) async fn handle_envelope(self: &Arc<Self>, from: &Address, env: Envelope) {
        if env.command.is_correlated_response() {
            let id = env.id;
            if !self.resolve_pending(id, env) {
                debug!("unmatched response id {} from {}", id, from);
            }
            return;
        }

        if matches!(env.command, Command::Discovery(_)) {
            return discovery::handle_discovery(self, env).await;
        }
        if matches!(env.command, Command::Pairing) {
            return discovery::handle_pairing(self, from, &env).await;
        }
        if matches!(env.command, Command::FileChunk(_)) {
            return transfer::handle_chunk(self, from, &env).await;
        }

        let id = env.id;
        let origin = env.origin.clone();
        let topic = env.topic.clone();

        match env.command {
            Command::Keepalive { sent_at } => {
                let reply = Envelope {
                    id,
                    origin: self.address.clone(),
                    timestamp: now_millis(),
                    ttl: 0,
                    visited: Default::default(),
                    topic: None,
                    command: Command::KeepaliveResponse { sent_at },
                };
                let _ = self.send_to(from, reply).await;
            }
            Command::KeepaliveResponse { sent_at } => {
                if let Some(edge) = self.edges_write().get_mut(from) {
                    edge.complete_ping(sent_at);
                }
            }
            Command::ReportPaired(p) => {
                // Re-announcement on a live edge: refresh subscriptions.
                let subs: HashSet<String> = p.subscriptions.iter().cloned().collect();
                if let Some(edge) = self.edges_write().get_mut(from) {
                    edge.update_subscriptions(subs);
                }
                if p.paired {
                    self.pair_overlap(from);
                }
            }
            Command::PairDeclined => {
                if let Some(topic) = &topic {
                    if self.pairings().unpair(topic, from) {
                        debug!("pairing on '{}' declined by {}", topic, from);
                    }
                }
            }
            Command::Unpair => {
                if let Some(topic) = &topic {
                    if self.pairings().unpair(topic, from) {
                        debug!("unpaired from {} on '{}'", from, topic);
                    }
                }
            }
            Command::TopicMessage(payload) => {
                let Some(topic) = topic else {
                    warn!("topic_message without topic from {}", from);
                    return;
                };
                if self.is_subscribed(&topic) {
                    self.pairings().touch(&topic, from);
                    self.delivery.push(TopicMessage {
                        topic,
                        source: origin,
                        payload: payload.into_inner(),
                    });
                }
            }
            Command::FileResumeFrom { file_id, index } => {
                transfer::on_sender_control(self, from, file_id, TransferControl::ResumeFrom(index));
            }
            Command::FlowPause { file_id } => {
                transfer::on_sender_control(self, from, file_id, TransferControl::Pause);
            }
            Command::FlowResume { file_id } => {
                transfer::on_sender_control(self, from, file_id, TransferControl::Resume);
            }
            Command::FileBusy { file_id } => {
                debug!("{} is busy, aborting file transfer {}", from, file_id);
                transfer::on_sender_control(self, from, file_id, TransferControl::Abort);
            }
            Command::FileTransferFailed { file_id, reason } => {
                transfer::on_sender_control(self, from, file_id, TransferControl::Abort);
                transfer::drop_inbound(self, file_id, &reason).await;
            }
            Command::CaRequestCertificate(request) => {
                let outcome = match &self.ca {
                    Some(ca) => ca.lock().await.handle_request(&request),
                    None => CertificateOutcome::Rejected {
                        reason: "not a certificate authority".to_string(),
                    },
                };
                let reply = Envelope {
                    id,
                    origin: self.address.clone(),
                    timestamp: now_millis(),
                    ttl: 0,
                    visited: Default::default(),
                    topic: None,
                    command: Command::CaRequestCertificateResponse(outcome),
                };
                let _ = self.send_to(from, reply).await;
            }
            Command::CaRevoke { serial } => match &self.ca {
                Some(ca) => {
                    if let Err(e) = ca.lock().await.revoke(serial) {
                        warn!("revocation of serial {} failed: {}", serial, e);
                    }
                }
                None => warn!("ca_revoke received by non-CA node from {}", from),
            },
            Command::CaGetCrl => {
                let crl_pem = match &self.ca {
                    Some(ca) => ca.lock().await.crl_pem().to_string(),
                    None => String::new(),
                };
                let reply = Envelope {
                    id,
                    origin: self.address.clone(),
                    timestamp: now_millis(),
                    ttl: 0,
                    visited: Default::default(),
                    topic: None,
                    command: Command::CaGetCrlResponse { crl_pem },
                };
                let _ = self.send_to(from, reply).await;
            }
            Command::ProxyCall(payload) => {
                let outcome = match &self.proxy {
                    Some(registry) => registry.dispatch(&payload).await,
                    None => ProxyOutcome::Err {
                        kind: "refused".to_string(),
                        reason: "proxy layer disabled".to_string(),
                    },
                };
                let reply = Envelope {
                    id,
                    origin: self.address.clone(),
                    timestamp: now_millis(),
                    ttl: 0,
                    visited: Default::default(),
                    topic: None,
                    command: Command::ProxyCallResponse(outcome),
                };
                let _ = self.send_to(from, reply).await;
            }
            Command::TooManyEdges => {
                warn!("{} refused us: too many edges", from);
                // Resource refusal, not a fault — close without reconnecting.
                if let Some(edge) = self.edges_write().remove(from) {
                    edge.abort_reader();
                }
                self.pairings().remove_peer(from);
            }
            Command::Terminate => {
                info!("terminate received from {}", from);
                self.stop();
            }
            // Handled before the match.
            Command::Discovery(_)
            | Command::Pairing
            | Command::FileChunk(_)
            | Command::CaRequestCertificateResponse(_)
            | Command::CaGetCrlResponse { .. }
            | Command::ProxyCallResponse(_) => {}
        }
    }

    // =========================================================================
    // STATE ACCESS
    // =========================================================================

    fn edges_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Address, Edge>> {
        self.edges.read().expect("edge set poisoned")
    }

    fn edges_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Address, Edge>> {
        self.edges.write().expect("edge set poisoned")
    }

    pub(crate) fn pairings(&self) -> MutexGuard<'_, PairingTable> {
        self.pairings.lock().expect("pairing table poisoned")
    }

    pub(crate) fn seen(&self) -> MutexGuard<'_, SeenCache> {
        self.seen.lock().expect("seen cache poisoned")
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .expect("subscriptions poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .read()
            .expect("subscriptions poisoned")
            .contains(topic)
    }

    fn topics_bounded(&self) -> Topics {
        let mut topics = Topics::default();
        for topic in self.subscriptions() {
            if !topics.push(topic) {
                break;
            }
        }
        topics
    }

    /// Pair on every topic both sides subscribe to (explicit `*connect`).
    fn pair_overlap(&self, peer: &Address) {
        let shared: Vec<String> = {
            let edges = self.edges_read();
            let Some(edge) = edges.get(peer) else {
                return;
            };
            let subs = self.subscriptions.read().expect("subscriptions poisoned");
            edge.subscriptions
                .iter()
                .filter(|t| subs.contains(*t))
                .cloned()
                .collect()
        };
        let mut pairings = self.pairings();
        for topic in shared {
            if pairings.pair(&topic, peer) {
                debug!("paired with {} on '{}' (explicit connect)", peer, topic);
            }
        }
    }

    pub(crate) fn edge_senders(&self) -> Vec<(Address, mpsc::Sender<Envelope>)> {
        self.edges_read()
            .iter()
            .map(|(addr, edge)| (addr.clone(), edge.sender()))
            .collect()
    }

    pub(crate) fn sender_for(&self, addr: &Address) -> Option<mpsc::Sender<Envelope>> {
        self.edges_read().get(addr).map(|edge| edge.sender())
    }

    /// Queue an envelope on the edge to `addr`.
    pub async fn send_to(&self, addr: &Address, env: Envelope) -> Result<(), NodeError> {
        let sender = self
            .sender_for(addr)
            .ok_or_else(|| NodeError::UnknownEdge(addr.clone()))?;
        sender
            .send(env)
            .await
            .map_err(|_| NodeError::EdgeClosed(addr.clone()))
    }

    pub fn edge_count(&self) -> usize {
        self.edges_read().len()
    }

    pub fn edge_addresses(&self) -> Vec<Address> {
        self.edges_read().keys().cloned().collect()
    }

    pub fn is_paired(&self, topic: &str, peer: &Address) -> bool {
        self.pairings().is_paired(topic, peer)
    }

    pub fn paired_peers(&self, topic: &str) -> Vec<Address> {
        self.pairings().peers(topic)
    }

    pub fn latency_ms(&self, peer: &Address) -> Option<i64> {
        self.edges_read().get(peer).and_then(|e| e.latency_ms)
    }

    /// Messages dropped by the bounded delivery queue.
    pub fn queue_overflow(&self) -> u64 {
        self.delivery.overflow()
    }

    pub fn queue_len(&self) -> usize {
        self.delivery.len()
    }

    /// Discovery envelopes dropped by the (origin, id) dedupe cache.
    pub fn duplicates_dropped(&self) -> u64 {
        self.seen().duplicates()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("tasks poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub(crate) fn transfers_in(
        &self,
    ) -> &tokio::sync::Mutex<HashMap<Uuid, FileRecord>> {
        &self.transfers_in
    }

    pub(crate) fn register_outbound_transfer(
        &self,
        file_id: Uuid,
        peer: &Address,
        ctl: mpsc::Sender<TransferControl>,
    ) {
        self.transfers_out
            .lock()
            .expect("transfers poisoned")
            .insert((file_id, peer.clone()), ctl);
    }

    pub(crate) fn unregister_outbound_transfer(&self, file_id: Uuid, peer: &Address) {
        self.transfers_out
            .lock()
            .expect("transfers poisoned")
            .remove(&(file_id, peer.clone()));
    }

    pub(crate) fn outbound_transfer(
        &self,
        file_id: Uuid,
        peer: &Address,
    ) -> Option<mpsc::Sender<TransferControl>> {
        self.transfers_out
            .lock()
            .expect("transfers poisoned")
            .get(&(file_id, peer.clone()))
            .cloned()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// BACKGROUND TASKS
// =============================================================================

async fn run_accept(node: Arc<Node>, listener: TcpListener) {
    let mut shutdown = node.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let n = node.clone();
                    let handle = tokio::spawn(async move {
                        handle_inbound(n, stream, peer).await;
                    });
                    node.track_task(handle);
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_inbound(node: Arc<Node>, stream: TcpStream, peer_sock: std::net::SocketAddr) {
    stream.set_nodelay(true).ok();
    let (reader, writer): (BoxedReader, BoxedWriter) = match &node.tls {
        Some(ctx) => match ctx.acceptor().accept(stream).await {
            Ok(tls_stream) => {
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            }
            Err(e) => {
                // Security refusal happens before any envelope is read.
                warn!("audit: TLS handshake from {} rejected: {}", peer_sock, e);
                return;
            }
        },
        None => {
            let (r, w) = tokio::io::split(stream);
            (Box::new(r), Box::new(w))
        }
    };

    let mut frame_reader = FrameReader::new(reader, node.config.max_frame_bytes);
    let mut frame_writer = FrameWriter::new(writer, node.config.max_frame_bytes);

    let env = match timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        frame_reader.read_envelope(),
    )
    .await
    {
        Ok(Ok(env)) => env,
        Ok(Err(e)) => {
            debug!("handshake read from {} failed: {}", peer_sock, e);
            return;
        }
        Err(_) => {
            debug!("handshake from {} timed out", peer_sock);
            return;
        }
    };

    let peer = match env.command {
        Command::ReportPaired(p) => p,
        other => {
            warn!(
                "{} sent {} before report_paired, closing",
                peer_sock,
                other.name()
            );
            return;
        }
    };

    if node.edge_count() >= node.config.max_connections {
        warn!("refusing inbound edge from {}: too many edges", peer.address);
        let reply = Envelope::new(node.address.clone(), Command::TooManyEdges);
        let _ = frame_writer.write_envelope(&reply).await;
        return;
    }
    if node.edges_read().contains_key(&peer.address) {
        warn!("duplicate inbound connection from {}, closing", peer.address);
        return;
    }

    let hello = Envelope::new(
        node.address.clone(),
        Command::ReportPaired(ReportPairedPayload {
            address: node.address.clone(),
            subscriptions: node.topics_bounded(),
            paired: peer.paired,
        }),
    );
    if frame_writer.write_envelope(&hello).await.is_err() {
        return;
    }

    let peer_addr = peer.address.clone();
    let subs: HashSet<String> = peer.subscriptions.iter().cloned().collect();
    if let Err(e) = node.install_edge(
        peer_addr.clone(),
        frame_reader,
        frame_writer,
        subs,
        true,
        false,
        false,
    ) {
        warn!("failed to install inbound edge from {}: {}", peer_addr, e);
        return;
    }
    if peer.paired {
        node.pair_overlap(&peer_addr);
    }
    info!("edge accepted from {}", peer_addr);
}

pub(crate) async fn run_reader(node: Arc<Node>, addr: Address, mut reader: FrameReader) {
    let mut shutdown = node.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = reader.read_envelope() => match res {
                Ok(env) => node.handle_envelope(&addr, env).await,
                Err(e) => {
                    if e.is_eof() {
                        debug!("edge {} closed by peer", addr);
                    } else {
                        warn!("protocol error on edge {}: {}", addr, e);
                    }
                    break;
                }
            }
        }
    }
    node.teardown_edge(&addr, "read loop ended").await;
}

/// Probe every edge on the `latency_update` cadence and tear down edges
/// whose probe went unanswered past `keepalive_timeout`.
async fn run_keepalive(node: Arc<Node>) {
    let mut shutdown = node.shutdown_rx();
    let check_every = node
        .config
        .keepalive_timeout
        .div_f64(2.0)
        .min(node.config.latency_update)
        .max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(check_every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let probe_due = node.config.latency_update.as_millis() as i64;
                let (dead, probes) = {
                    let mut edges = node.edges_write();
                    let mut dead = Vec::new();
                    let mut probes = Vec::new();
                    for (addr, edge) in edges.iter_mut() {
                        if edge.ping_timed_out(node.config.keepalive_timeout) {
                            dead.push(addr.clone());
                        } else if edge.ping_sent_at.is_none()
                            && now_millis() - edge.last_probe_at() >= probe_due
                        {
                            let sent_at = edge.start_ping();
                            probes.push((addr.clone(), edge.sender(), sent_at));
                        }
                    }
                    (dead, probes)
                };

                for addr in dead {
                    warn!("edge {} missed keepalive, closing", addr);
                    node.teardown_edge(&addr, "keepalive timeout").await;
                }
                for (addr, sender, sent_at) in probes {
                    let env = Envelope::new(
                        node.address.clone(),
                        Command::Keepalive { sent_at },
                    );
                    if sender.send(env).await.is_err() {
                        debug!("keepalive to {} not queued", addr);
                    }
                }
            }
        }
    }
}

async fn run_reconnect(node: Arc<Node>, addr: Address, paired: bool) {
    let mut shutdown = node.shutdown_rx();
    let mut state = RetryState::new();
    loop {
        if let Some(budget) = node.config.reconnections {
            if state.attempts >= budget {
                warn!(
                    "giving up on {} after {} reconnect attempts",
                    addr, state.attempts
                );
                return;
            }
        }
        let delay = state.next_delay();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        match node.connect_address(addr.clone(), paired, true).await {
            Ok(_) => {
                info!("reconnected to {}", addr);
                return;
            }
            Err(NodeError::Stopped) => return,
            Err(e) => {
                debug!("reconnect to {} failed: {}", addr, e);
                state.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_schedule() {
        let mut state = RetryState::new();
        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(state.next_delay().as_secs());
            state.record_failure();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(state.attempts, 7);
    }
}
