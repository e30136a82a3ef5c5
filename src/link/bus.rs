// src/link/bus.rs
//
// In-process publish/subscribe hub between the read loop and network
// transports. Every subscriber owns an independent unbounded queue, so a
// slow or vanished consumer cannot stall the publisher or its peers.
//
// Queues are unbounded by policy: the device produces on the order of 50
// packets/s plus console lines, and live consumers drain continuously. A
// consumer that drops its Subscription is pruned at the next publish.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::link::GatewayEvent;

/// A subscriber's receiving half. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl Subscription {
    /// Identity used with [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for the next queued event.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.rx.try_recv().ok()
    }
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

struct BusInner {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

/// Fan-out event hub: one publisher, many subscribers.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Mutex::new(BusInner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a new subscriber. It observes only events published after
    /// this call; there is no replay of history.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("bus lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(SubscriberEntry { id, tx });
        Subscription { id, rx }
    }

    /// Remove a subscriber. Its pending queue is dropped.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("bus lock");
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Deliver `event` to every current subscriber, in registration order.
    /// Never blocks; subscribers whose receiver is gone are pruned here.
    pub fn publish(&self, event: GatewayEvent) {
        let mut inner = self.inner.lock().expect("bus lock");
        inner.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("bus lock").subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
