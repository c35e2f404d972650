//! Per-peer edge: writer queue, keepalive state, declared subscriptions.
//!
//! Writes are serialized by a dedicated writer task consuming a bounded
//! queue, so envelopes handed to one edge reach the peer in hand-off order.
//! The read loop lives in the node (it needs the dispatcher); the edge owns
//! its abort handle.

use crate::net::codec::FrameWriter;
use crate::net::envelope::Envelope;
use crate::types::{now, now_millis, Address};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Edge {
    pub address: Address,
    pub inbound: bool,
    /// Explicitly `connect()`ed by the user — the reconnect policy applies.
    pub explicit: bool,
    /// The explicit connect asked for immediate pairing (`*` prefix).
    pub explicit_paired: bool,
    /// Topics the peer declared in `report_paired`.
    pub subscriptions: HashSet<String>,
    pub connected_at: u64,
    /// Outstanding keepalive (`sent_at` millis); `None` when answered.
    pub ping_sent_at: Option<i64>,
    /// When the last probe was sent (millis); paces the probe cadence.
    last_probe_at: i64,
    /// Last `keepalive_response` arrival (millis).
    pub pong_at: i64,
    pub latency_ms: Option<i64>,
    tx: mpsc::Sender<Envelope>,
    reader: Option<JoinHandle<()>>,
}

impl Edge {
    pub fn new(
        address: Address,
        inbound: bool,
        explicit: bool,
        explicit_paired: bool,
        subscriptions: HashSet<String>,
        tx: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            address,
            inbound,
            explicit,
            explicit_paired,
            subscriptions,
            connected_at: now(),
            ping_sent_at: None,
            last_probe_at: 0,
            pong_at: now_millis(),
            latency_ms: None,
            tx,
            reader: None,
        }
    }

    /// Clone the writer-queue handle; sends stay ordered per edge.
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.tx.clone()
    }

    pub(crate) fn set_reader(&mut self, handle: JoinHandle<()>) {
        self.reader = Some(handle);
    }

    /// Abort the read task; dropping the edge afterwards closes the writer
    /// queue and with it the socket.
    pub(crate) fn abort_reader(&self) {
        if let Some(handle) = &self.reader {
            handle.abort();
        }
    }

    /// Record an outgoing keepalive. Returns its `sent_at` echo token.
    pub fn start_ping(&mut self) -> i64 {
        let sent_at = now_millis();
        self.ping_sent_at = Some(sent_at);
        self.last_probe_at = sent_at;
        sent_at
    }

    pub fn last_probe_at(&self) -> i64 {
        self.last_probe_at
    }

    /// Match a `keepalive_response` against the outstanding probe.
    pub fn complete_ping(&mut self, sent_at: i64) -> bool {
        if self.ping_sent_at == Some(sent_at) {
            let arrived = now_millis();
            self.latency_ms = Some(arrived.saturating_sub(sent_at));
            self.pong_at = arrived;
            self.ping_sent_at = None;
            true
        } else {
            false
        }
    }

    /// An unanswered probe older than `timeout` declares the edge dead.
    pub fn ping_timed_out(&self, timeout: Duration) -> bool {
        match self.ping_sent_at {
            Some(sent_at) => {
                now_millis().saturating_sub(sent_at) > timeout.as_millis() as i64
            }
            None => false,
        }
    }

    pub fn update_subscriptions(&mut self, topics: impl IntoIterator<Item = String>) {
        self.subscriptions = topics.into_iter().collect();
    }
}

/// Writer task: drains the edge queue into the framed stream. Exits when
/// every sender is dropped or the stream errors; the read loop notices the
/// dead socket and triggers edge teardown.
pub(crate) async fn run_writer(
    address: Address,
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(env) = rx.recv().await {
        if let Err(e) = writer.write_envelope(&env).await {
            debug!("write to {} failed: {}", address, e);
            break;
        }
    }
    rx.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeClass;

    fn edge() -> Edge {
        let (tx, _rx) = mpsc::channel(8);
        Edge::new(
            Address::new(NodeClass::Node, "127.0.0.1", 65430),
            false,
            true,
            false,
            HashSet::new(),
            tx,
        )
    }

    #[test]
    fn ping_round_trip_records_latency() {
        let mut e = edge();
        let sent_at = e.start_ping();
        assert!(e.ping_sent_at.is_some());
        assert!(e.complete_ping(sent_at));
        assert!(e.ping_sent_at.is_none());
        assert!(e.latency_ms.is_some());
    }

    #[test]
    fn stale_pong_is_ignored() {
        let mut e = edge();
        let _ = e.start_ping();
        assert!(!e.complete_ping(12345));
        assert!(e.ping_sent_at.is_some());
    }

    #[test]
    fn no_outstanding_ping_never_times_out() {
        let e = edge();
        assert!(!e.ping_timed_out(Duration::from_millis(0)));
    }

    #[test]
    fn outstanding_ping_times_out() {
        let mut e = edge();
        e.ping_sent_at = Some(now_millis() - 20_000);
        assert!(e.ping_timed_out(Duration::from_secs(14)));
    }
}
