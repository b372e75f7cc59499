//! Double ratchet session
//!
//! A [`Session`] owns one [`SessionState`] and the subscription plumbing
//! around it: it keeps at most two open subscriptions (one per known peer
//! ratchet key), swaps them under the same lock as the ratchet transition,
//! and fans successfully decrypted inner events out to registered handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use nostr::{Event, EventBuilder, Filter, Kind, PublicKey, SecretKey, UnsignedEvent};

use crate::bus::{EventBus, Subscription};
use crate::constant::MESSAGE_EVENT_KIND;
use crate::error::Error;
use crate::state::SessionState;

/// Handler of decrypted inner events.
pub type InnerEventHandler = Arc<dyn Fn(UnsignedEvent) + Send + Sync>;

/// Outcome of [`Session::send`]: the signed outer event to publish and the
/// inner event it carries.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Signed outer event; the caller publishes this to the bus.
    pub event: Event,
    /// The unsigned inner event that was encrypted.
    pub inner_event: UnsignedEvent,
}

/// A pairwise double ratchet session bound to an event bus.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    name: String,
    bus: Arc<dyn EventBus>,
    guts: Mutex<SessionGuts>,
    handlers: Mutex<Vec<InnerEventHandler>>,
    crypto_failures: AtomicU64,
}

/// State and subscriptions live behind one lock: a ratchet transition and the
/// subscription swap that follows it are a single critical section.
struct SessionGuts {
    state: SessionState,
    subscriptions: HashMap<PublicKey, Subscription>,
}

impl Session {
    /// Initialize a new session from handshake material.
    ///
    /// The responder side subscribes immediately for the peer's first header
    /// key; the initiator subscribes for the announced next key.
    pub fn new<S>(
        bus: Arc<dyn EventBus>,
        their_public: PublicKey,
        our_secret: SecretKey,
        is_initiator: bool,
        shared_secret: [u8; 32],
        name: S,
    ) -> Result<Self, Error>
    where
        S: Into<String>,
    {
        let state = SessionState::new(their_public, our_secret, is_initiator, shared_secret)?;
        Ok(Self::attach(bus, state, name.into()))
    }

    /// Rebind a deserialized state to a bus, re-subscribing for the peer's
    /// known ratchet keys.
    pub fn from_state<S>(bus: Arc<dyn EventBus>, state: SessionState, name: S) -> Self
    where
        S: Into<String>,
    {
        Self::attach(bus, state, name.into())
    }

    fn attach(bus: Arc<dyn EventBus>, state: SessionState, name: String) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                name,
                bus,
                guts: Mutex::new(SessionGuts {
                    state,
                    subscriptions: HashMap::new(),
                }),
                handlers: Mutex::new(Vec::new()),
                crypto_failures: AtomicU64::new(0),
            }),
        };

        let mut guts = lock(&session.inner.guts);
        SessionInner::sync_subscriptions(&session.inner, &mut guts);
        drop(guts);

        session
    }

    /// Session name, used to tell rotated sessions of a device apart.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Public half of the identity key this session was initialized with.
    pub fn our_identity_public(&self) -> PublicKey {
        lock(&self.inner.guts).state.our_identity_public()
    }

    /// Snapshot of the session state, for persistence.
    pub fn state(&self) -> SessionState {
        lock(&self.inner.guts).state.clone()
    }

    /// Number of inbound events dropped because of crypto failures.
    pub fn crypto_failures(&self) -> u64 {
        self.inner.crypto_failures.load(Ordering::Relaxed)
    }

    /// Register a handler invoked with every successfully decrypted inner
    /// event, in bus delivery order.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(UnsignedEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).push(Arc::new(handler));
    }

    /// Encrypt a chat message.
    ///
    /// The caller publishes the returned outer event.
    pub fn send(&self, content: &str) -> Result<SendResult, Error> {
        let rumor: UnsignedEvent = EventBuilder::new(Kind::PrivateDirectMessage, content)
            .build(self.our_identity_public());
        self.send_event(rumor)
    }

    /// Encrypt an arbitrary inner event.
    pub fn send_event(&self, rumor: UnsignedEvent) -> Result<SendResult, Error> {
        let event: Event = {
            let mut guts = lock(&self.inner.guts);
            guts.state.encrypt(&rumor)?
        };

        tracing::debug!(
            target: "nostr_double_ratchet::session::send_event",
            "Session {} encrypted event {}",
            self.inner.name,
            event.id
        );

        Ok(SendResult {
            event,
            inner_event: rumor,
        })
    }

    /// Decrypt an inbound event.
    ///
    /// Returns `None` for events that don't belong to this session or fail to
    /// decrypt; the session state is only advanced on success. Decrypted
    /// inner events are also delivered to [`Session::on_event`] handlers.
    pub fn decrypt_event(&self, event: &Event) -> Option<UnsignedEvent> {
        SessionInner::handle_event(&self.inner, event)
    }

    /// Decrypt an event against a detached state, without touching any
    /// subscriptions. The state is advanced only on success.
    pub fn decrypt_event_with_state(
        state: &mut SessionState,
        event: &Event,
    ) -> Option<UnsignedEvent> {
        state.decrypt_event(event)
    }

    /// Tear the session down, cancelling all subscriptions.
    pub fn close(&self) {
        let mut guts = lock(&self.inner.guts);
        guts.subscriptions.clear();
        drop(guts);
        lock(&self.inner.handlers).clear();
    }
}

impl SessionInner {
    /// Decrypt, commit, swap subscriptions, then notify handlers outside the
    /// lock.
    fn handle_event(inner: &Arc<Self>, event: &Event) -> Option<UnsignedEvent> {
        let rumor: Option<UnsignedEvent> = {
            let mut guts = lock(&inner.guts);
            let mut working = guts.state.clone();
            match working.try_decrypt(event) {
                Ok(Some(rumor)) => {
                    guts.state = working;
                    Self::sync_subscriptions(inner, &mut guts);
                    Some(rumor)
                }
                Ok(None) => None,
                Err(e) => {
                    if e.is_crypto_failure() {
                        inner.crypto_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::debug!(
                        target: "nostr_double_ratchet::session::handle_event",
                        "Session {} dropping event {}: {e}",
                        inner.name,
                        event.id
                    );
                    None
                }
            }
        };

        if let Some(rumor) = rumor {
            let handlers: Vec<InnerEventHandler> = lock(&inner.handlers).clone();
            for handler in handlers {
                handler(rumor.clone());
            }
            return Some(rumor);
        }
        None
    }

    /// Keep exactly one subscription per known peer ratchet key, dropping the
    /// ones a rotation made stale. Must be called with `guts` locked.
    fn sync_subscriptions(inner: &Arc<Self>, guts: &mut SessionGuts) {
        let targets: Vec<PublicKey> = [
            guts.state.their_current_ratchet_public(),
            guts.state.their_next_ratchet_public(),
        ]
        .into_iter()
        .flatten()
        .collect();

        guts.subscriptions
            .retain(|public_key, _| targets.contains(public_key));

        for public_key in targets {
            if guts.subscriptions.contains_key(&public_key) {
                continue;
            }

            let filter = Filter::new()
                .kind(Kind::from(MESSAGE_EVENT_KIND))
                .author(public_key);
            let weak: Weak<SessionInner> = Arc::downgrade(inner);
            let subscription = inner.bus.subscribe(
                filter,
                Arc::new(move |event: &Event| {
                    if let Some(inner) = weak.upgrade() {
                        Self::handle_event(&inner, event);
                    }
                }),
            );
            guts.subscriptions.insert(public_key, subscription);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nostr::Keys;

    use super::*;
    use crate::bus::MemoryBus;

    fn pair(bus: &MemoryBus) -> (Session, Session) {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let shared_secret = [0u8; 32];
        let a = Session::new(
            Arc::new(bus.clone()),
            bob.public_key(),
            alice.secret_key().clone(),
            true,
            shared_secret,
            "alice",
        )
        .unwrap();
        let b = Session::new(
            Arc::new(bus.clone()),
            alice.public_key(),
            bob.secret_key().clone(),
            false,
            shared_secret,
            "bob",
        )
        .unwrap();
        (a, b)
    }

    #[test]
    fn test_one_shot_send() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        let output = alice.send("hello bob").unwrap();
        let inner = bob.decrypt_event(&output.event).unwrap();
        assert_eq!(inner.content, "hello bob");
        assert_eq!(inner, output.inner_event);
    }

    #[test]
    fn test_delivery_through_the_bus() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bob.on_event(move |rumor| sink.lock().unwrap().push(rumor.content));

        for msg in ["one", "two", "three"] {
            bus.publish(alice.send(msg).unwrap().event);
        }

        assert_eq!(*received.lock().unwrap(), ["one", "two", "three"]);
    }

    #[test]
    fn test_out_of_order_delivery_order_is_preserved() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bob.on_event(move |rumor| sink.lock().unwrap().push(rumor.content));

        let e1 = alice.send("one").unwrap().event;
        let e2 = alice.send("two").unwrap().event;
        let e3 = alice.send("three").unwrap().event;

        // Handlers observe bus delivery order, not send order.
        for event in [e3, e1, e2] {
            bus.publish(event);
        }

        assert_eq!(*received.lock().unwrap(), ["three", "one", "two"]);
    }

    #[test]
    fn test_conversation_over_the_bus_rotates_subscriptions() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        let bob_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&bob_seen);
        bob.on_event(move |rumor| sink.lock().unwrap().push(rumor.content));

        let alice_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&alice_seen);
        alice.on_event(move |rumor| sink.lock().unwrap().push(rumor.content));

        for i in 0..4 {
            bus.publish(alice.send(&format!("ping {i}")).unwrap().event);
            bus.publish(bob.send(&format!("pong {i}")).unwrap().event);
        }

        assert_eq!(bob_seen.lock().unwrap().len(), 4);
        assert_eq!(alice_seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_offline_decrypt_with_serialized_state() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        bus.publish(alice.send("warmup").unwrap().event);
        let in_flight = alice.send("while offline").unwrap().event;

        let json = serde_json::to_string(&bob.state()).unwrap();
        let mut restored: SessionState = serde_json::from_str(&json).unwrap();

        let inner = Session::decrypt_event_with_state(&mut restored, &in_flight).unwrap();
        assert_eq!(inner.content, "while offline");

        // The live session still decrypts the same event identically.
        assert_eq!(
            bob.decrypt_event(&in_flight).unwrap().content,
            "while offline"
        );
    }

    #[test]
    fn test_crypto_failures_are_counted_and_swallowed() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let bus: Arc<MemoryBus> = Arc::new(MemoryBus::new());

        let good = Session::new(
            bus.clone(),
            bob.public_key(),
            alice.secret_key().clone(),
            true,
            [0u8; 32],
            "good",
        )
        .unwrap();
        let receiver = Session::new(
            bus.clone(),
            alice.public_key(),
            bob.secret_key().clone(),
            false,
            [0u8; 32],
            "receiver",
        )
        .unwrap();
        // Same keys, different shared secret: valid events the receiver
        // cannot decrypt.
        let diverged = Session::new(
            bus.clone(),
            bob.public_key(),
            alice.secret_key().clone(),
            true,
            [7u8; 32],
            "diverged",
        )
        .unwrap();

        let undecryptable = diverged.send("noise").unwrap().event;
        let snapshot = receiver.state();
        assert!(receiver.decrypt_event(&undecryptable).is_none());
        assert_eq!(receiver.crypto_failures(), 1);
        assert_eq!(receiver.state(), snapshot);

        // The honest flow is unaffected.
        let output = good.send("hello").unwrap();
        assert_eq!(receiver.decrypt_event(&output.event).unwrap().content, "hello");
    }

    #[test]
    fn test_close_cancels_subscriptions() {
        let bus = MemoryBus::new();
        let (alice, bob) = pair(&bus);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bob.on_event(move |rumor| sink.lock().unwrap().push(rumor.content));

        bob.close();
        bus.publish(alice.send("into the void").unwrap().event);
        assert!(received.lock().unwrap().is_empty());
    }
}
