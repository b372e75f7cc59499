//! Event bus adapter
//!
//! Sessions and invite listeners consume a single capability from the
//! surrounding application: subscribing to a filtered stream of events. The
//! adapter must invoke callbacks one at a time and must not invoke them from
//! inside [`EventBus::subscribe`] itself; publishing is the caller's business.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nostr::{Event, Filter};

/// Callback invoked for every event matching a subscription filter.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// A filtered event stream provider.
pub trait EventBus: Send + Sync {
    /// Subscribe to events matching `filter`.
    ///
    /// The returned handle cancels the subscription when dropped.
    fn subscribe(&self, filter: Filter, on_event: EventCallback) -> Subscription;
}

/// Owned handle of an active subscription.
///
/// Cancelling is idempotent; dropping the handle cancels.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wrap an unsubscribe action.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Cancel the subscription.
    pub fn cancel(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(mut poisoned) => poisoned.get_mut().take(),
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// In-process event bus with relay retention semantics.
///
/// Keeps every published event, except that for replaceable kinds only the
/// newest event per `(pubkey, kind, d-tag)` tuple is retained. Events are
/// delivered to matching subscriptions at publish time; subscribing does not
/// replay retained events.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    events: Mutex<Vec<Event>>,
    subscribers: Mutex<HashMap<u64, (Filter, EventCallback)>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    /// New empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event, delivering it to matching subscriptions.
    pub fn publish(&self, event: Event) {
        {
            let mut events: MutexGuard<Vec<Event>> = lock(&self.inner.events);
            if is_replaceable(&event) {
                events.retain(|stored| {
                    !(stored.pubkey == event.pubkey
                        && stored.kind == event.kind
                        && identifier(stored) == identifier(&event)
                        && stored.created_at <= event.created_at)
                });
            }
            events.push(event.clone());
        }

        // Snapshot the matching callbacks so they can subscribe and
        // unsubscribe reentrantly while being invoked.
        let callbacks: Vec<EventCallback> = {
            let subscribers = lock(&self.inner.subscribers);
            subscribers
                .values()
                .filter(|(filter, _)| filter.match_event(&event, nostr::filter::MatchEventOptions::default()))
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// All retained events.
    pub fn events(&self) -> Vec<Event> {
        lock(&self.inner.events).clone()
    }

    /// Retained events matching `filter`.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        lock(&self.inner.events)
            .iter()
            .filter(|event| filter.match_event(event, nostr::filter::MatchEventOptions::default()))
            .cloned()
            .collect()
    }
}

impl EventBus for MemoryBus {
    fn subscribe(&self, filter: Filter, on_event: EventCallback) -> Subscription {
        let id: u64 = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).insert(id, (filter, on_event));

        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            lock(&inner.subscribers).remove(&id);
        })
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus")
            .field("events", &lock(&self.inner.events).len())
            .field("subscribers", &lock(&self.inner.subscribers).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Whether the bus retains only the newest `(pubkey, kind, d-tag)` tuple.
fn is_replaceable(event: &Event) -> bool {
    let kind: u16 = event.kind.as_u16();
    (10000..20000).contains(&kind) || (30000..40000).contains(&kind)
}

/// First `d` tag value of an event.
fn identifier(event: &Event) -> Option<&str> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        match slice.first() {
            Some(name) if name == "d" => slice.get(1).map(|value| value.as_str()),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use nostr::{EventBuilder, Keys, Kind, Tag};

    use super::*;
    use crate::constant::{INVITE_LIST_KIND, MESSAGE_EVENT_KIND};

    #[test]
    fn test_replaceable_event_retention() {
        let bus = MemoryBus::new();
        let keys = Keys::generate();

        for content in ["first", "second"] {
            let event = EventBuilder::new(Kind::from(INVITE_LIST_KIND), content)
                .tag(Tag::identifier("double-ratchet/invite-list"))
                .sign_with_keys(&keys)
                .unwrap();
            bus.publish(event);
        }

        let events = bus.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "second");
    }

    #[test]
    fn test_regular_events_accumulate() {
        let bus = MemoryBus::new();
        let keys = Keys::generate();

        for content in ["first", "second"] {
            let event = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), content)
                .sign_with_keys(&keys)
                .unwrap();
            bus.publish(event);
        }

        assert_eq!(bus.events().len(), 2);
    }

    #[test]
    fn test_subscription_filtering_and_cancel() {
        let bus = MemoryBus::new();
        let keys = Keys::generate();
        let seen = Arc::new(AtomicUsize::new(0));

        let filter = Filter::new().author(keys.public_key());
        let counter = Arc::clone(&seen);
        let subscription = bus.subscribe(
            filter,
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let matching = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), "yes")
            .sign_with_keys(&keys)
            .unwrap();
        let other = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), "no")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        bus.publish(matching.clone());
        bus.publish(other);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Cancelling twice is fine; no further deliveries.
        subscription.cancel();
        subscription.cancel();
        bus.publish(matching);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
