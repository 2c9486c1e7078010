//! Event broadcaster
//!
//! Fans progress events out to every connected observer. Each subscription
//! owns a bounded outbound buffer; a subscriber whose buffer is full is
//! disconnected instead of slowing down publication to the others.
//!
//! Dropping a [`Subscription`] unsubscribes it, so a transport-level
//! disconnect (axum dropping the SSE stream) cleans up on its own. Removing
//! a subscription never affects the batch being processed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use ihale_common::events::{ProgressEvent, QueueStatus};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::hub::{self, Shared, SharedState};

pub type SubscriptionId = u64;

/// What a subscriber wants to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Every event kind
    Progress,
    /// `queue_status` only (dashboard side channel)
    QueueStatus,
}

impl SubscriptionKind {
    fn wants(self, event: &ProgressEvent) -> bool {
        match self {
            SubscriptionKind::Progress => true,
            SubscriptionKind::QueueStatus => matches!(event, ProgressEvent::QueueStatus(_)),
        }
    }
}

struct Subscriber {
    kind: SubscriptionKind,
    tx: mpsc::Sender<Arc<ProgressEvent>>,
}

/// Registry of live subscriptions (guarded by the hub mutex)
pub(crate) struct SubscriberList {
    next_id: SubscriptionId,
    capacity: usize,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

impl SubscriberList {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 1,
            capacity: capacity.max(1),
            subscribers: HashMap::new(),
        }
    }

    fn add(
        &mut self,
        kind: SubscriptionKind,
        snapshot: QueueStatus,
    ) -> (SubscriptionId, mpsc::Receiver<Arc<ProgressEvent>>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        // Fresh channel: the snapshot always fits
        let _ = tx.try_send(Arc::new(ProgressEvent::QueueStatus(snapshot)));
        self.subscribers.insert(id, Subscriber { kind, tx });
        (id, rx)
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        count
    }

    /// Offer the event to every interested subscriber without waiting.
    ///
    /// Returns the number of subscribers that accepted it. Subscribers that
    /// are gone or whose buffer is full are dropped from the list.
    pub fn publish(&mut self, event: ProgressEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if !subscriber.kind.wants(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscription_id = id,
                        backlog = self.capacity,
                        "Subscriber backlog exceeded, disconnecting"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription_id = id, "Subscriber gone");
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            self.subscribers.remove(&id);
        }

        debug!(
            "Broadcast {} to {} subscribers",
            event.event_type(),
            delivered
        );
        delivered
    }
}

/// Handle for publishing and subscribing
#[derive(Clone)]
pub struct Broadcaster {
    shared: SharedState,
}

impl Broadcaster {
    pub(crate) fn new(shared: SharedState) -> Self {
        Self { shared }
    }

    /// Register a new observer.
    ///
    /// The first event it receives is a `queue_status` snapshot taken under
    /// the same lock as registration, so no transition can fall between the
    /// snapshot and the live feed.
    pub fn subscribe(&self, kind: SubscriptionKind) -> Subscription {
        let mut shared = hub::lock(&self.shared);
        let snapshot = shared.book.status();
        let (id, rx) = shared.subscribers.add(kind, snapshot);
        info!(
            subscription_id = id,
            ?kind,
            "Subscriber connected, total subscribers: {}",
            shared.subscribers.len()
        );
        Subscription {
            id,
            kind,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Publish to every live subscription; never blocks on a subscriber.
    ///
    /// Batch terminal events are also kept in the queue book so clients
    /// that missed them can look them up.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut shared = hub::lock(&self.shared);
        shared.book.remember_terminal(&event);
        shared.subscribers.publish(event)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        hub::lock(&self.shared).subscribers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        hub::lock(&self.shared).subscribers.len()
    }

    /// Drop every subscriber; their streams end after draining the backlog
    pub fn disconnect_all(&self) -> usize {
        let count = hub::lock(&self.shared).subscribers.clear();
        info!("Disconnected {} subscribers", count);
        count
    }
}

/// One observer's receiving end
pub struct Subscription {
    id: SubscriptionId,
    kind: SubscriptionKind,
    rx: mpsc::Receiver<Arc<ProgressEvent>>,
    shared: Weak<Mutex<Shared>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Next event; `None` once the broadcaster has dropped this subscriber
    pub async fn recv(&mut self) -> Option<Arc<ProgressEvent>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests and drains
    pub fn try_recv(&mut self) -> Option<Arc<ProgressEvent>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if hub::lock(&shared).subscribers.remove(self.id) {
                debug!(subscription_id = self.id, "Subscriber disconnected");
            }
        }
    }
}
