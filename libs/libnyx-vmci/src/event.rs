//! Event subscriptions
//!
//! Queue pair lifecycle changes (peer attach, peer detach, memory resumed)
//! and context removal are published here. Subscribers are invoked outside
//! the table lock, on the publishing thread.

use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use std::sync::Arc;

use crate::error::{Result, VmciError};
use crate::handle::{ContextId, Handle};
use crate::sync::TableLock;

/// Kinds of transport events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A VM context went away.
    ContextRemoved,
    /// The peer attached to a queue pair we created.
    QueuePairPeerAttach,
    /// The peer detached from a queue pair.
    QueuePairPeerDetach,
    /// Queue pair memory became accessible again.
    QueuePairResumed,
}

/// An event instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Queue pair handle, or the invalid handle for context events.
    pub handle: Handle,
    /// The peer (or removed) context.
    pub context: ContextId,
}

/// Subscription identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event callback.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    kind: EventKind,
    callback: EventCallback,
}

/// Publish/subscribe table for transport events.
pub struct EventBus {
    subscribers: TableLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: TableLock::new(HashMap::new(), "event_subscribers"),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .insert(id, Subscriber { kind, callback });
        tracing::trace!(?kind, ?id, "event subscription added");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscribers
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(VmciError::NotFound)
    }

    /// Deliver an event to every subscriber of its kind.
    pub fn publish(&self, event: Event) {
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .read()
            .values()
            .filter(|subscriber| subscriber.kind == event.kind)
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect();

        tracing::debug!(kind = ?event.kind, handle = %event.handle, count = callbacks.len(), "publishing event");
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_publish_filters_by_kind() {
        let bus = EventBus::new();
        let attaches = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attaches);
        bus.subscribe(
            EventKind::QueuePairPeerAttach,
            Arc::new(move |_: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let handle = Handle::new(10, 2000);
        bus.publish(Event { kind: EventKind::QueuePairPeerAttach, handle, context: 2 });
        bus.publish(Event { kind: EventKind::QueuePairPeerDetach, handle, context: 2 });

        assert_eq!(attaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::ContextRemoved, Arc::new(|_: &Event| {}));
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id).unwrap();
        assert!(matches!(bus.unsubscribe(id), Err(VmciError::NotFound)));
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot = Arc::new(spin::Mutex::new(None));

        let inner_bus = Arc::clone(&bus);
        let inner_slot = Arc::clone(&slot);
        let id = bus.subscribe(
            EventKind::QueuePairResumed,
            Arc::new(move |_: &Event| {
                if let Some(id) = inner_slot.lock().take() {
                    inner_bus.unsubscribe(id).unwrap();
                }
            }),
        );
        *slot.lock() = Some(id);

        bus.publish(Event {
            kind: EventKind::QueuePairResumed,
            handle: Handle::INVALID,
            context: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
