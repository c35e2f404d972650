//! Topic streaming plane: the bounded delivery queue and session handle.

use crate::net::node::Node;
use crate::types::Address;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// An application message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub source: Address,
    pub payload: Vec<u8>,
}

/// Bounded delivery queue: drop-oldest on overflow, counted in
/// `queue_overflow`. Messages from one sender on one topic come out in
/// push order; nothing is guaranteed across senders or topics.
pub struct DeliveryQueue {
    inner: Mutex<VecDeque<TopicMessage>>,
    capacity: usize,
    overflow: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            overflow: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, msg: TopicMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.inner.lock().expect("delivery queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.overflow.fetch_add(1, Ordering::SeqCst);
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Wait for the next message; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<TopicMessage> {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_recv() {
                return Some(msg);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<TopicMessage> {
        self.inner.lock().expect("delivery queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("delivery queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped to keep the queue within capacity.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Scoped consumer handle. Dropping the session stops the node — the scoped
/// equivalent of calling [`Node::stop`] on scope exit. For long-lived
/// consumption use [`Node::recv`] directly and call `stop()` explicitly.
pub struct Session {
    node: Arc<Node>,
}

impl Session {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub async fn recv(&self) -> Option<TopicMessage> {
        self.node.recv().await
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.node.stop();
    }
}
