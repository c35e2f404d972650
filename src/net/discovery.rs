//! TTL-bounded, subscription-driven peer discovery and pairing.
//!
//! A node floods a `discovery` envelope per unpaired topic. Receivers that
//! subscribe to the topic dial the asking node back with `pairing`; everyone
//! else forwards the envelope while its ttl lasts, appending themselves to
//! the visited list so loops die out. The first responder per round wins;
//! the rest are told `pair_declined`.

use crate::net::envelope::{Command, DiscoveryPayload, Envelope};
use crate::net::node::Node;
use crate::types::{now, Address};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entries evicted at once when the seen-cache is full.
const SEEN_EVICTION_BATCH: usize = 4096;

/// FIFO-evicting (origin, envelope id) cache.
///
/// The visited list already suppresses loops; this cache is the second
/// fence, catching duplicates that arrive over parallel paths or tampered
/// visited lists so no envelope is ever processed twice.
pub struct SeenCache {
    set: HashSet<(Address, u64)>,
    order: VecDeque<(Address, u64)>,
    capacity: usize,
    duplicates: u64,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            duplicates: 0,
        }
    }

    /// Record (origin, id). Returns false — and counts a duplicate — when
    /// the pair was already seen.
    pub fn insert(&mut self, origin: Address, id: u64) -> bool {
        let key = (origin, id);
        if self.set.contains(&key) {
            self.duplicates += 1;
            return false;
        }

        if self.set.len() >= self.capacity {
            for _ in 0..SEEN_EVICTION_BATCH {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }

        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Envelopes dropped because they were already processed.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Pairing state per (topic, peer), plus the per-topic discovery round used
/// for first-responder tie-breaking.
#[derive(Default)]
pub struct PairingTable {
    /// topic → peer → last traffic (epoch seconds)
    pairs: HashMap<String, HashMap<Address, u64>>,
    /// topic → round opened at (epoch seconds)
    open_rounds: HashMap<String, u64>,
}

impl PairingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the pairing is new.
    pub fn pair(&mut self, topic: &str, peer: &Address) -> bool {
        self.pairs
            .entry(topic.to_string())
            .or_default()
            .insert(peer.clone(), now())
            .is_none()
    }

    pub fn unpair(&mut self, topic: &str, peer: &Address) -> bool {
        let Some(peers) = self.pairs.get_mut(topic) else {
            return false;
        };
        let removed = peers.remove(peer).is_some();
        if peers.is_empty() {
            self.pairs.remove(topic);
        }
        removed
    }

    pub fn is_paired(&self, topic: &str, peer: &Address) -> bool {
        self.pairs
            .get(topic)
            .is_some_and(|peers| peers.contains_key(peer))
    }

    pub fn has_any(&self, topic: &str) -> bool {
        self.pairs.get(topic).is_some_and(|p| !p.is_empty())
    }

    pub fn peers(&self, topic: &str) -> Vec<Address> {
        self.pairs
            .get(topic)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Record traffic on a pairing, deferring its idle expiry.
    pub fn touch(&mut self, topic: &str, peer: &Address) {
        if let Some(stamp) = self.pairs.get_mut(topic).and_then(|p| p.get_mut(peer)) {
            *stamp = now();
        }
    }

    /// Drop every pairing with a peer whose edge died. Returns the topics
    /// affected.
    pub fn remove_peer(&mut self, peer: &Address) -> Vec<String> {
        let mut affected = Vec::new();
        self.pairs.retain(|topic, peers| {
            if peers.remove(peer).is_some() {
                affected.push(topic.clone());
            }
            !peers.is_empty()
        });
        affected
    }

    /// Pairings without traffic for `idle_secs`.
    pub fn idle(&self, idle_secs: u64) -> Vec<(String, Address)> {
        let cutoff = now().saturating_sub(idle_secs);
        let mut out = Vec::new();
        for (topic, peers) in &self.pairs {
            for (peer, stamp) in peers {
                if *stamp < cutoff {
                    out.push((topic.clone(), peer.clone()));
                }
            }
        }
        out
    }

    /// Open a discovery round for a topic; the first `pairing` accepted
    /// closes it.
    pub fn open_round(&mut self, topic: &str) {
        self.open_rounds.insert(topic.to_string(), now());
    }

    /// Consume the open round if one is live within `window_secs`.
    pub fn take_round(&mut self, topic: &str, window_secs: u64) -> bool {
        match self.open_rounds.get(topic) {
            Some(opened) if now().saturating_sub(*opened) <= window_secs => {
                self.open_rounds.remove(topic);
                true
            }
            Some(_) => {
                self.open_rounds.remove(topic);
                false
            }
            None => false,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.values().map(|p| p.len()).sum()
    }
}

/// Periodic driver: emits a discovery round for every unpaired topic and
/// expires idle pairings.
pub(crate) async fn run_ticker(node: Arc<Node>) {
    let mut shutdown = node.shutdown_rx();
    let mut interval = tokio::time::interval(node.config().discovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; rounds start one interval in.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                expire_idle_pairings(&node).await;
                emit_round(&node).await;
            }
        }
    }
}

/// Send one `discovery` envelope per local topic with no current pairing.
pub(crate) async fn emit_round(node: &Arc<Node>) {
    let me = node.address().clone();
    let topics: Vec<String> = {
        let pairings = node.pairings();
        node.subscriptions()
            .into_iter()
            .filter(|t| !pairings.has_any(t))
            .collect()
    };
    if topics.is_empty() {
        return;
    }

    let senders = node.edge_senders();
    if senders.is_empty() {
        return;
    }

    for topic in topics {
        node.pairings().open_round(&topic);

        let mut env = Envelope::new(
            me.clone(),
            Command::Discovery(DiscoveryPayload {
                previous_node: me.clone(),
            }),
        )
        .with_topic(topic.clone())
        .with_ttl(node.config().discovery_ttl);
        env.visited.push(me.clone());

        debug!("discovery round for '{}' (ttl {})", topic, env.ttl);
        for (_, sender) in &senders {
            let _ = sender.send(env.clone()).await;
        }
    }
}

async fn expire_idle_pairings(node: &Arc<Node>) {
    let idle_secs = node.config().pairing_idle_timeout.as_secs();
    let idle = node.pairings().idle(idle_secs);
    for (topic, peer) in idle {
        debug!("unpairing idle ({}, {})", topic, peer);
        node.pairings().unpair(&topic, &peer);
        let env = Envelope::new(node.address().clone(), Command::Unpair).with_topic(&topic);
        let _ = node.send_to(&peer, env).await;
    }
}

/// Receiver side of a `discovery` envelope: respond, then forward.
pub(crate) async fn handle_discovery(node: &Arc<Node>, env: Envelope) {
    let Command::Discovery(payload) = &env.command else {
        return;
    };
    let Some(topic) = env.topic.clone() else {
        warn!("discovery envelope without topic from {}", env.origin);
        return;
    };
    let me = node.address().clone();

    // Loop suppression: we already forwarded this envelope.
    if env.visited.iter().any(|a| *a == me) {
        return;
    }

    // Parallel-path dedupe by (origin, id).
    if !node.seen().insert(env.origin.clone(), env.id) {
        return;
    }

    let previous = payload.previous_node.clone();
    let interested = node.is_subscribed(&topic)
        && previous != me
        && !node.pairings().is_paired(&topic, &previous);
    if interested {
        respond_with_pairing(node, &previous, &topic).await;
    }

    if env.ttl == 0 {
        return;
    }
    let mut fwd = env;
    fwd.ttl -= 1;
    if !fwd.visited.push(me) {
        // Hop record full — flooding stops here.
        return;
    }
    for (addr, sender) in node.edge_senders() {
        if fwd.visited.iter().any(|a| *a == addr) {
            continue;
        }
        let _ = sender.send(fwd.clone()).await;
    }
}

/// Dial the asking node back and offer a pairing. The pairing is recorded
/// optimistically and rolled back on `pair_declined`.
async fn respond_with_pairing(node: &Arc<Node>, previous: &Address, topic: &str) {
    if node.sender_for(previous).is_none() {
        if let Err(e) = node.connect_address(previous.clone(), false, false).await {
            debug!("pairing dial to {} failed: {}", previous, e);
            return;
        }
    }

    node.pairings().pair(topic, previous);
    let env = Envelope::new(node.address().clone(), Command::Pairing).with_topic(topic);
    if node.send_to(previous, env).await.is_err() {
        node.pairings().unpair(topic, previous);
    }
}

/// Initiator side of a `pairing` offer: first responder of an open round
/// wins, everyone else is declined.
pub(crate) async fn handle_pairing(node: &Arc<Node>, from: &Address, env: &Envelope) {
    let Some(topic) = env.topic.clone() else {
        warn!("pairing envelope without topic from {}", from);
        return;
    };

    let window = node.config().pairing_timeout.as_secs();
    let accepted = {
        let mut pairings = node.pairings();
        if pairings.is_paired(&topic, from) {
            // Already paired with this peer — nothing changes until unpair.
            true
        } else if node.is_subscribed(&topic) && pairings.take_round(&topic, window) {
            pairings.pair(&topic, from);
            true
        } else {
            false
        }
    };

    if accepted {
        debug!("paired with {} on '{}'", from, topic);
    } else {
        let reply = env.reply(node.address().clone(), Command::PairDeclined);
        let _ = node.send_to(from, reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeClass;

    fn addr(port: u16) -> Address {
        Address::new(NodeClass::Node, "127.0.0.1", port)
    }

    #[test]
    fn seen_cache_counts_duplicates() {
        let mut cache = SeenCache::new(16);
        assert!(cache.insert(addr(1), 42));
        assert!(!cache.insert(addr(1), 42));
        assert!(cache.insert(addr(1), 43));
        assert!(cache.insert(addr(2), 42));
        assert_eq!(cache.duplicates(), 1);
    }

    #[test]
    fn seen_cache_evicts_oldest() {
        let mut cache = SeenCache::new(8);
        for id in 0..10_000u64 {
            cache.insert(addr(1), id);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn pairing_round_trip() {
        let mut table = PairingTable::new();
        assert!(table.pair("t", &addr(1)));
        assert!(!table.pair("t", &addr(1)));
        assert!(table.is_paired("t", &addr(1)));
        assert!(table.has_any("t"));
        assert!(!table.is_paired("t", &addr(2)));

        assert!(table.unpair("t", &addr(1)));
        assert!(!table.has_any("t"));
        assert!(!table.unpair("t", &addr(1)));
    }

    #[test]
    fn round_accepts_only_first() {
        let mut table = PairingTable::new();
        table.open_round("t");
        assert!(table.take_round("t", 5));
        // Second responder arrives after the round was consumed.
        assert!(!table.take_round("t", 5));
    }

    #[test]
    fn remove_peer_clears_all_topics() {
        let mut table = PairingTable::new();
        table.pair("a", &addr(1));
        table.pair("b", &addr(1));
        table.pair("b", &addr(2));

        let affected = table.remove_peer(&addr(1));
        assert_eq!(affected.len(), 2);
        assert!(!table.has_any("a"));
        assert!(table.is_paired("b", &addr(2)));
    }
}
