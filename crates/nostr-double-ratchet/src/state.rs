//! Session state
//!
//! [`SessionState`] is the authoritative state of a pairwise double ratchet
//! session; everything else is derivable from it. The ratchet state machine
//! itself lives here as pure computation so that a deserialized state can
//! decrypt in-flight events offline, without any subscription wiring.
//!
//! Outbound events are signed by the sender's current ratchet key: the event
//! `pubkey` is the per-message header key recipients filter by, and it rotates
//! on every DH ratchet step. The message header (message number, previous
//! chain length and the advertised next ratchet key) travels NIP-44 encrypted
//! in the `header` tag, under a per-chain header key derived from the root
//! ratchet.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use nostr::nips::nip59::RANGE_RANDOM_TIMESTAMP_TWEAK;
use nostr::{
    Event, EventBuilder, Keys, Kind, PublicKey, SecretKey, Tag, TagKind, Timestamp, UnsignedEvent,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::constant::{HEADER_TAG, MAX_SKIP, MAX_SKIPPED_KEYS, MESSAGE_EVENT_KIND};
use crate::crypto;
use crate::error::Error;
use crate::serde_util;

/// Per-message metadata, NIP-44 encrypted under the chain's header key and
/// carried in the `header` tag of the outer event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageHeader {
    /// Message number within the sending chain.
    pub(crate) number: u32,
    /// Length of the sender's previous sending chain.
    pub(crate) previous_chain_length: u32,
    /// The ratchet public key the sender will rotate to next.
    pub(crate) next_public_key: PublicKey,
}

/// Message keys derived but not yet consumed, kept for a retired or
/// fast-forwarded receiving chain so late events can still decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedKeys {
    /// Header keys of the chain (and, once known, of its successor), so late
    /// headers remain decryptable after rotation.
    #[serde(with = "serde_util::hex32_vec")]
    pub(crate) header_keys: Vec<[u8; 32]>,
    /// Message number to message key.
    #[serde(with = "serde_util::hex32_map")]
    pub(crate) message_keys: BTreeMap<u32, [u8; 32]>,
}

impl Drop for SkippedKeys {
    fn drop(&mut self) {
        for key in self.header_keys.iter_mut() {
            key.zeroize();
        }
        for key in self.message_keys.values_mut() {
            key.zeroize();
        }
    }
}

/// Authoritative state of a pairwise double ratchet session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Public half of the identity key this session was initialized with;
    /// used as the author of inner events.
    pub(crate) our_identity_public: PublicKey,
    /// Input to the DH ratchet KDF.
    #[serde(with = "serde_util::hex32")]
    pub(crate) root_key: [u8; 32],
    /// The DH key we currently sign and send under. Its public half is the
    /// `pubkey` of our outbound events. `None` until the first outbound step.
    #[serde(with = "serde_util::keys_opt")]
    pub(crate) our_current_ratchet_key: Option<Keys>,
    /// The pair that becomes current on the next ratchet step; its public
    /// half is advertised in every outbound header.
    #[serde(with = "serde_util::keys")]
    pub(crate) our_next_ratchet_key: Keys,
    /// The peer ratchet key of the receiving chain in progress.
    pub(crate) their_current_ratchet_public: Option<PublicKey>,
    /// The peer ratchet key announced for their next rotation.
    pub(crate) their_next_ratchet_public: Option<PublicKey>,
    #[serde(with = "serde_util::hex32_opt")]
    pub(crate) sending_chain_key: Option<[u8; 32]>,
    #[serde(with = "serde_util::hex32_opt")]
    pub(crate) receiving_chain_key: Option<[u8; 32]>,
    #[serde(with = "serde_util::hex32_opt")]
    pub(crate) sending_header_key: Option<[u8; 32]>,
    #[serde(with = "serde_util::hex32_opt")]
    pub(crate) receiving_header_key: Option<[u8; 32]>,
    pub(crate) sending_chain_message_number: u32,
    pub(crate) receiving_chain_message_number: u32,
    /// Length of our sending chain before the last rotation, carried in
    /// headers so the receiver can finalize the superseded chain.
    pub(crate) previous_sending_chain_message_count: u32,
    /// Skipped message keys by peer ratchet public key.
    pub(crate) skipped_keys: HashMap<PublicKey, SkippedKeys>,
    /// Insertion order of `skipped_keys` entries, for wholesale FIFO eviction.
    pub(crate) skipped_order: Vec<PublicKey>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        for key in [
            &mut self.sending_chain_key,
            &mut self.receiving_chain_key,
            &mut self.sending_header_key,
            &mut self.receiving_header_key,
        ]
        .into_iter()
        .flatten()
        {
            key.zeroize();
        }
    }
}

impl SessionState {
    /// Initialize state for a new session.
    ///
    /// Both sides derive the first root key by mixing `shared_secret` into
    /// `DH(our_secret, their_public)`, and seed `our_next_ratchet_key` with
    /// the identity pair so the first outbound header of either side is
    /// predictable from the handshake material.
    pub fn new(
        their_public: PublicKey,
        our_secret: SecretKey,
        is_initiator: bool,
        shared_secret: [u8; 32],
    ) -> Result<Self, Error> {
        let our_identity = Keys::new(our_secret);
        let dh = crypto::conversation_key(our_identity.secret_key(), &their_public)?;
        let root_key = crypto::initial_root_key(&dh, &shared_secret);

        let their_current_ratchet_public = if is_initiator { None } else { Some(their_public) };

        Ok(Self {
            our_identity_public: our_identity.public_key(),
            root_key,
            our_current_ratchet_key: None,
            our_next_ratchet_key: our_identity,
            their_current_ratchet_public,
            their_next_ratchet_public: Some(their_public),
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_header_key: None,
            receiving_header_key: None,
            sending_chain_message_number: 0,
            receiving_chain_message_number: 0,
            previous_sending_chain_message_count: 0,
            skipped_keys: HashMap::new(),
            skipped_order: Vec::new(),
        })
    }

    /// Public half of the identity key this session was initialized with.
    #[inline]
    pub fn our_identity_public(&self) -> PublicKey {
        self.our_identity_public
    }

    /// The peer ratchet key of the receiving chain in progress.
    #[inline]
    pub fn their_current_ratchet_public(&self) -> Option<PublicKey> {
        self.their_current_ratchet_public
    }

    /// The peer ratchet key announced for their next rotation.
    #[inline]
    pub fn their_next_ratchet_public(&self) -> Option<PublicKey> {
        self.their_next_ratchet_public
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys
            .values()
            .map(|entry| entry.message_keys.len())
            .sum()
    }

    /// Encrypt an inner event into a signed outer event.
    ///
    /// Performs a DH ratchet step first if no sending chain is available.
    pub(crate) fn encrypt(&mut self, rumor: &UnsignedEvent) -> Result<Event, Error> {
        if self.sending_chain_key.is_none() {
            let their_next = self
                .their_next_ratchet_public
                .ok_or(Error::InvalidState("peer ratchet key unknown"))?;
            let dh = crypto::conversation_key(self.our_next_ratchet_key.secret_key(), &their_next)?;
            let (root_key, chain_key, header_key) = crypto::root_step(&self.root_key, &dh);

            self.root_key = root_key;
            self.sending_chain_key = Some(chain_key);
            self.sending_header_key = Some(header_key);
            self.previous_sending_chain_message_count = self.sending_chain_message_number;
            self.sending_chain_message_number = 0;
            self.our_current_ratchet_key = Some(self.our_next_ratchet_key.clone());
            self.our_next_ratchet_key = Keys::generate();
        }

        let chain_key: [u8; 32] = self
            .sending_chain_key
            .ok_or(Error::InvalidState("sending chain missing"))?;
        let header_key: [u8; 32] = self
            .sending_header_key
            .ok_or(Error::InvalidState("sending header key missing"))?;
        let signer: Keys = self
            .our_current_ratchet_key
            .clone()
            .ok_or(Error::InvalidState("current ratchet key missing"))?;

        let (chain_key, message_key) = crypto::chain_step(&chain_key);
        let header = MessageHeader {
            number: self.sending_chain_message_number,
            previous_chain_length: self.previous_sending_chain_message_count,
            next_public_key: self.our_next_ratchet_key.public_key(),
        };
        self.sending_chain_key = Some(chain_key);
        self.sending_chain_message_number += 1;

        let encrypted_header: String =
            crypto::encrypt_with_key(&header_key, &serde_json::to_vec(&header)?)?;
        let content: String =
            crypto::encrypt_with_key(&message_key, serde_json::to_string(rumor)?.as_bytes())?;

        let event = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), content)
            .tag(Tag::custom(TagKind::custom(HEADER_TAG), [encrypted_header]))
            .custom_created_at(Timestamp::tweaked(RANGE_RANDOM_TIMESTAMP_TWEAK))
            .sign_with_keys(&signer)?;
        Ok(event)
    }

    /// Decrypt an inbound event, committing state changes only on success.
    ///
    /// Returns `None` both for events that don't belong to this session and
    /// for events that fail to decrypt; in either case the state is left
    /// exactly as it was.
    pub fn decrypt_event(&mut self, event: &Event) -> Option<UnsignedEvent> {
        let mut working = self.clone();
        match working.try_decrypt(event) {
            Ok(Some(rumor)) => {
                *self = working;
                Some(rumor)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(
                    target: "nostr_double_ratchet::state::decrypt_event",
                    "Dropping undecryptable event {}: {e}",
                    event.id
                );
                None
            }
        }
    }

    /// Dispatch an inbound event by its `pubkey`.
    ///
    /// `Ok(None)` means the event is not addressed to this session (not an
    /// error: sessions are probed by many events they don't own). `Err` means
    /// the event matched but could not be processed; the caller must discard
    /// this state copy.
    pub(crate) fn try_decrypt(&mut self, event: &Event) -> Result<Option<UnsignedEvent>, Error> {
        if event.kind != Kind::from(MESSAGE_EVENT_KIND) {
            return Ok(None);
        }

        let is_current = self.their_current_ratchet_public == Some(event.pubkey);
        let is_next = self.their_next_ratchet_public == Some(event.pubkey);

        if !is_current && !is_next && !self.skipped_keys.contains_key(&event.pubkey) {
            return Ok(None);
        }

        if event.verify().is_err() {
            return Err(Error::MalformedEvent("invalid signature".to_string()));
        }

        if let Some(rumor) = self.decrypt_skipped(event)? {
            return Ok(Some(rumor));
        }

        if is_next && (self.receiving_chain_key.is_none() || !is_current) {
            return self.ratchet_step(event).map(Some);
        }

        if is_current && self.receiving_chain_key.is_some() {
            return self.chain_decrypt(event).map(Some);
        }

        Ok(None)
    }

    /// Decrypt with a cached skipped key, evicting it on use.
    fn decrypt_skipped(&mut self, event: &Event) -> Result<Option<UnsignedEvent>, Error> {
        let Some(entry) = self.skipped_keys.get_mut(&event.pubkey) else {
            return Ok(None);
        };

        let Some(header) = entry
            .header_keys
            .iter()
            .find_map(|key| decrypt_header(key, event).ok())
        else {
            return Ok(None);
        };

        let Some(message_key) = entry.message_keys.remove(&header.number) else {
            return Ok(None);
        };

        let plaintext = crypto::decrypt_with_key(&message_key, &event.content)?;
        let rumor: UnsignedEvent = serde_json::from_slice(&plaintext)?;

        if entry.message_keys.is_empty() {
            self.skipped_keys.remove(&event.pubkey);
            self.skipped_order.retain(|public_key| public_key != &event.pubkey);
        }

        Ok(Some(rumor))
    }

    /// DH ratchet step triggered by an event signed with the announced next
    /// peer ratchet key.
    fn ratchet_step(&mut self, event: &Event) -> Result<UnsignedEvent, Error> {
        let ratchet_key: Keys = self
            .our_current_ratchet_key
            .clone()
            .unwrap_or_else(|| self.our_next_ratchet_key.clone());
        let dh = crypto::conversation_key(ratchet_key.secret_key(), &event.pubkey)?;
        let (root_key, chain_key, header_key) = crypto::root_step(&self.root_key, &dh);

        // The header decrypts under the new chain's header key and tells us
        // how long the superseded chain was.
        let header = decrypt_header(&header_key, event)?;
        self.finalize_receiving_chain(header.previous_chain_length, &header_key);

        self.root_key = root_key;
        self.their_current_ratchet_public = Some(event.pubkey);
        self.their_next_ratchet_public = Some(event.pubkey);
        self.receiving_chain_key = Some(chain_key);
        self.receiving_header_key = Some(header_key);
        self.receiving_chain_message_number = 0;

        // Our sending side rotates with it: new chain under our announced
        // next key, which becomes current.
        let dh = crypto::conversation_key(self.our_next_ratchet_key.secret_key(), &event.pubkey)?;
        let (root_key, chain_key, header_key) = crypto::root_step(&self.root_key, &dh);
        self.root_key = root_key;
        self.sending_chain_key = Some(chain_key);
        self.sending_header_key = Some(header_key);
        self.previous_sending_chain_message_count = self.sending_chain_message_number;
        self.sending_chain_message_number = 0;
        self.our_current_ratchet_key = Some(self.our_next_ratchet_key.clone());
        self.our_next_ratchet_key = Keys::generate();

        self.chain_decrypt(event)
    }

    /// Decrypt within the current receiving chain, fast-forwarding over
    /// skipped message numbers.
    fn chain_decrypt(&mut self, event: &Event) -> Result<UnsignedEvent, Error> {
        let header_key: [u8; 32] = self
            .receiving_header_key
            .ok_or(Error::InvalidState("receiving header key missing"))?;
        let header = decrypt_header(&header_key, event)?;

        if header.number < self.receiving_chain_message_number {
            // The per-message key was consumed and wiped; out-of-order
            // delivery is served from the skipped cache only.
            return Err(Error::InvalidState("message key already consumed"));
        }

        self.skip_message_keys(header.number, &header_key)?;

        let chain_key: [u8; 32] = self
            .receiving_chain_key
            .ok_or(Error::InvalidState("receiving chain missing"))?;
        let (chain_key, message_key) = crypto::chain_step(&chain_key);

        let plaintext = crypto::decrypt_with_key(&message_key, &event.content)?;
        let rumor: UnsignedEvent = serde_json::from_slice(&plaintext)?;

        self.receiving_chain_key = Some(chain_key);
        self.receiving_chain_message_number = header.number + 1;
        self.their_next_ratchet_public = Some(header.next_public_key);

        Ok(rumor)
    }

    /// Derive and cache message keys of the current receiving chain up to
    /// (excluding) `until`.
    fn skip_message_keys(&mut self, until: u32, header_key: &[u8; 32]) -> Result<(), Error> {
        if until <= self.receiving_chain_message_number {
            return Ok(());
        }
        if until - self.receiving_chain_message_number > MAX_SKIP {
            return Err(Error::BoundExceeded);
        }

        let Some(current) = self.their_current_ratchet_public else {
            return Ok(());
        };
        let Some(mut chain_key) = self.receiving_chain_key else {
            return Ok(());
        };

        while self.receiving_chain_message_number < until {
            let (next_chain_key, message_key) = crypto::chain_step(&chain_key);
            self.store_skipped(
                current,
                &[*header_key],
                self.receiving_chain_message_number,
                message_key,
            );
            chain_key = next_chain_key;
            self.receiving_chain_message_number += 1;
        }
        self.receiving_chain_key = Some(chain_key);

        Ok(())
    }

    /// Move the remainder of the receiving chain being superseded into the
    /// skipped cache, so its unseen messages can still decrypt after rotation.
    ///
    /// A remainder beyond the skip bound is dropped instead of derived; the
    /// event that triggered the rotation still decrypts.
    fn finalize_receiving_chain(&mut self, previous_chain_length: u32, next_header_key: &[u8; 32]) {
        let Some(old_header_key) = self.receiving_header_key else {
            return;
        };
        let Some(current) = self.their_current_ratchet_public else {
            return;
        };
        let Some(mut chain_key) = self.receiving_chain_key else {
            return;
        };

        if previous_chain_length > self.receiving_chain_message_number
            && previous_chain_length - self.receiving_chain_message_number > MAX_SKIP
        {
            tracing::debug!(
                target: "nostr_double_ratchet::state::finalize_receiving_chain",
                "Dropping {} unseen keys of the superseded chain",
                previous_chain_length - self.receiving_chain_message_number
            );
            self.receiving_chain_key = None;
            return;
        }

        while self.receiving_chain_message_number < previous_chain_length {
            let (next_chain_key, message_key) = crypto::chain_step(&chain_key);
            self.store_skipped(
                current,
                &[old_header_key, *next_header_key],
                self.receiving_chain_message_number,
                message_key,
            );
            chain_key = next_chain_key;
            self.receiving_chain_message_number += 1;
        }
        self.receiving_chain_key = None;
    }

    /// Cache one skipped message key, enforcing the per-chain and aggregate
    /// bounds. Overflowing keys are silently dropped, oldest entries first.
    fn store_skipped(
        &mut self,
        ratchet_public: PublicKey,
        header_keys: &[[u8; 32]],
        number: u32,
        message_key: [u8; 32],
    ) {
        let entry = match self.skipped_keys.entry(ratchet_public) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.skipped_order.push(ratchet_public);
                entry.insert(SkippedKeys {
                    header_keys: Vec::new(),
                    message_keys: BTreeMap::new(),
                })
            }
        };

        for header_key in header_keys {
            if !entry.header_keys.contains(header_key) && entry.header_keys.len() < 2 {
                entry.header_keys.push(*header_key);
            }
        }

        entry.message_keys.insert(number, message_key);
        while entry.message_keys.len() > MAX_SKIP as usize {
            entry.message_keys.pop_first();
        }

        while self.skipped_key_count() > MAX_SKIPPED_KEYS && self.skipped_order.len() > 1 {
            let oldest = self.skipped_order.remove(0);
            self.skipped_keys.remove(&oldest);
        }
    }
}

/// Decrypt the `header` tag of an event under a chain header key.
fn decrypt_header(header_key: &[u8; 32], event: &Event) -> Result<MessageHeader, Error> {
    let payload: &String = event
        .tags
        .iter()
        .find_map(|tag| {
            let slice = tag.as_slice();
            match slice.first() {
                Some(name) if name == HEADER_TAG => slice.get(1),
                _ => None,
            }
        })
        .ok_or_else(|| Error::MalformedEvent("missing header tag".to_string()))?;

    let bytes = crypto::decrypt_with_key(header_key, payload)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use nostr::JsonUtil;

    use super::*;

    fn rumor(keys: &Keys, content: &str) -> UnsignedEvent {
        EventBuilder::new(Kind::PrivateDirectMessage, content).build(keys.public_key())
    }

    fn pair() -> (SessionState, SessionState, Keys, Keys) {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let shared_secret = [0u8; 32];
        let a = SessionState::new(
            bob.public_key(),
            alice.secret_key().clone(),
            true,
            shared_secret,
        )
        .unwrap();
        let b = SessionState::new(
            alice.public_key(),
            bob.secret_key().clone(),
            false,
            shared_secret,
        )
        .unwrap();
        (a, b, alice, bob)
    }

    #[test]
    fn test_one_shot_send() {
        let (mut a, mut b, alice, _) = pair();

        let event = a.encrypt(&rumor(&alice, "hello bob")).unwrap();
        let inner = b.decrypt_event(&event).unwrap();
        assert_eq!(inner.content, "hello bob");
        assert_eq!(inner.pubkey, alice.public_key());
    }

    #[test]
    fn test_bidirectional_with_rotation() {
        let (mut a, mut b, alice, bob) = pair();

        let e = a.encrypt(&rumor(&alice, "hello bob")).unwrap();
        assert_eq!(b.decrypt_event(&e).unwrap().content, "hello bob");

        let f = b.encrypt(&rumor(&bob, "hi alice")).unwrap();
        assert_eq!(a.decrypt_event(&f).unwrap().content, "hi alice");

        // The reply rotated alice's receiving chain onto bob's header key.
        assert_eq!(a.their_current_ratchet_public(), Some(f.pubkey));
    }

    #[test]
    fn test_long_conversation_with_rotations() {
        let (mut a, mut b, alice, bob) = pair();

        for i in 0..8 {
            let msg = format!("ping {i}");
            let e = a.encrypt(&rumor(&alice, &msg)).unwrap();
            assert_eq!(b.decrypt_event(&e).unwrap().content, msg);

            let msg = format!("pong {i}");
            let f = b.encrypt(&rumor(&bob, &msg)).unwrap();
            assert_eq!(a.decrypt_event(&f).unwrap().content, msg);
        }
    }

    #[test]
    fn test_responder_sends_first() {
        let (mut a, mut b, alice, bob) = pair();

        let e = b.encrypt(&rumor(&bob, "hey")).unwrap();
        assert_eq!(a.decrypt_event(&e).unwrap().content, "hey");

        let f = a.encrypt(&rumor(&alice, "hey back")).unwrap();
        assert_eq!(b.decrypt_event(&f).unwrap().content, "hey back");
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut a, mut b, alice, _) = pair();

        let e1 = a.encrypt(&rumor(&alice, "one")).unwrap();
        let e2 = a.encrypt(&rumor(&alice, "two")).unwrap();
        let e3 = a.encrypt(&rumor(&alice, "three")).unwrap();

        assert_eq!(b.decrypt_event(&e3).unwrap().content, "three");
        assert_eq!(b.decrypt_event(&e1).unwrap().content, "one");
        assert_eq!(b.decrypt_event(&e2).unwrap().content, "two");
    }

    #[test]
    fn test_out_of_order_across_rotation() {
        let (mut a, mut b, alice, bob) = pair();

        let e1 = a.encrypt(&rumor(&alice, "before")).unwrap();
        let e2 = a.encrypt(&rumor(&alice, "late")).unwrap();
        assert_eq!(b.decrypt_event(&e1).unwrap().content, "before");

        // A full round trip rotates both chains.
        let f = b.encrypt(&rumor(&bob, "reply")).unwrap();
        assert_eq!(a.decrypt_event(&f).unwrap().content, "reply");
        let g = a.encrypt(&rumor(&alice, "after")).unwrap();
        assert_eq!(b.decrypt_event(&g).unwrap().content, "after");

        // The late message from the superseded chain still decrypts once.
        assert_eq!(b.decrypt_event(&e2).unwrap().content, "late");
        assert!(b.decrypt_event(&e2).is_none());
    }

    #[test]
    fn test_duplicate_event_is_rejected() {
        let (mut a, mut b, alice, _) = pair();

        let e = a.encrypt(&rumor(&alice, "once")).unwrap();
        assert!(b.decrypt_event(&e).is_some());
        assert!(b.decrypt_event(&e).is_none());
    }

    #[test]
    fn test_foreign_event_leaves_state_untouched() {
        let (mut a, mut b, alice, _) = pair();

        let e = a.encrypt(&rumor(&alice, "warmup")).unwrap();
        b.decrypt_event(&e).unwrap();
        let snapshot = b.clone();

        let mallory = Keys::generate();
        let foreign = EventBuilder::new(Kind::from(MESSAGE_EVENT_KIND), "junk")
            .tag(Tag::custom(TagKind::custom(HEADER_TAG), ["junk"]))
            .sign_with_keys(&mallory)
            .unwrap();

        assert!(b.decrypt_event(&foreign).is_none());
        assert_eq!(b, snapshot);
    }

    #[test]
    fn test_tampered_event_leaves_state_untouched() {
        let (mut a, mut b, alice, _) = pair();

        let e = a.encrypt(&rumor(&alice, "warmup")).unwrap();
        b.decrypt_event(&e).unwrap();
        let snapshot = b.clone();

        // Valid signature over garbage content, sent under the current key.
        let e2 = a.encrypt(&rumor(&alice, "second")).unwrap();
        let tampered = Event::from_json(
            e2.as_json()
                .replace(&e2.content, "AspR7nNwseKKzCAAkIir3mGTCV7fyLHAIAeeAmaCaLSNiOuvvvpqAqzJxPk="),
        )
        .unwrap();

        assert!(b.decrypt_event(&tampered).is_none());
        assert_eq!(b, snapshot);
    }

    #[test]
    fn test_skip_bound_is_enforced() {
        let (mut a, mut b, alice, _) = pair();

        let e = a.encrypt(&rumor(&alice, "zero")).unwrap();
        b.decrypt_event(&e).unwrap();

        // Fast-forward the sender way past the receiver's skip bound.
        for _ in 0..(MAX_SKIP + 1) {
            a.encrypt(&rumor(&alice, "skipped")).unwrap();
        }
        let too_far = a.encrypt(&rumor(&alice, "out of reach")).unwrap();

        let snapshot = b.clone();
        assert!(b.decrypt_event(&too_far).is_none());
        assert_eq!(b, snapshot);
    }

    #[test]
    fn test_serde_roundtrip_preserves_behavior() {
        let (mut a, mut b, alice, _) = pair();

        // Leave a skipped key and an in-flight event behind.
        let e1 = a.encrypt(&rumor(&alice, "one")).unwrap();
        let e2 = a.encrypt(&rumor(&alice, "two")).unwrap();
        let e3 = a.encrypt(&rumor(&alice, "three")).unwrap();
        assert_eq!(b.decrypt_event(&e3).unwrap().content, "three");

        let json = serde_json::to_string(&b).unwrap();
        let mut restored: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, b);

        assert_eq!(restored.decrypt_event(&e1).unwrap().content, "one");
        assert_eq!(restored.decrypt_event(&e2).unwrap().content, "two");

        // The original is unaffected and decrypts the same events identically.
        assert_eq!(b.decrypt_event(&e2).unwrap().content, "two");
    }

    #[test]
    fn test_header_key_rotates_with_each_step() {
        let (mut a, mut b, alice, bob) = pair();

        let e1 = a.encrypt(&rumor(&alice, "one")).unwrap();
        b.decrypt_event(&e1).unwrap();
        let f1 = b.encrypt(&rumor(&bob, "two")).unwrap();
        a.decrypt_event(&f1).unwrap();
        let e2 = a.encrypt(&rumor(&alice, "three")).unwrap();

        // Each direction change puts a fresh signing key on the wire.
        assert_ne!(e1.pubkey, e2.pubkey);
        assert_ne!(e1.pubkey, f1.pubkey);
        assert_ne!(f1.pubkey, e2.pubkey);
    }
}
