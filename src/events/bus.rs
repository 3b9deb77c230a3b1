//! Broadcasting of lifecycle events to in-process subscribers.

use super::types::{DropReason, EventFilter, LifecycleEvent, Subscription, SubscriptionId};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Subscriber {
    filter: EventFilter,
    sender: Sender<LifecycleEvent>,
}

impl Subscriber {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: LifecycleEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Fan-out of committed lifecycle events. Slow subscribers are dropped
/// rather than blocking the committing thread.
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);

        self.subscribers
            .write()
            .insert(id, Subscriber { filter, sender });

        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            let _ = sub.sender.try_send(LifecycleEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Send each event to every matching subscriber.
    pub fn publish(&self, events: &[LifecycleEvent]) {
        if events.is_empty() || self.subscribers.read().is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                for event in events.iter().filter(|e| sub.filter.matches(e)) {
                    if !sub.try_send(event.clone()) {
                        dropped.push(*id);
                        break;
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut subs = self.subscribers.write();
            for id in dropped {
                tracing::debug!(subscription = id.0, "dropping slow event subscriber");
                subs.remove(&id);
            }
        }
    }
}
