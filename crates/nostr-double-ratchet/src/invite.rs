//! Invite handshake
//!
//! An [`Invite`] is an (ephemeral keypair, shared secret) bundle advertised by
//! a potential inviter, per device. Accepting it produces a one-shot response
//! envelope that hides the invitee's identity behind two encryption layers:
//! the inner DH layer authenticates the invitee to the inviter (only the
//! holder of the invitee identity key can produce it), while the outer
//! envelope keeps the invitee's public key away from anyone else who obtained
//! the invite link.

use std::sync::{Arc, Mutex, MutexGuard};

use nostr::nips::nip44::{self, Version};
use nostr::nips::nip59::RANGE_RANDOM_TIMESTAMP_TWEAK;
use hex;
use nostr::{
    Event, EventBuilder, Filter, Keys, Kind, PublicKey, SecretKey, Tag, TagKind, Timestamp,
    UnsignedEvent,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::bus::{EventBus, Subscription};
use crate::constant::{INVITE_EVENT_KIND, INVITE_IDENTIFIER_PREFIX, INVITE_RESPONSE_KIND};
use crate::crypto;
use crate::error::Error;
use crate::serde_util;
use crate::session::Session;

/// Encrypts an invite-response payload towards a peer.
///
/// Callers that keep their identity key elsewhere (hardware signer, remote
/// signer, ...) can pass a custom capability instead of the raw key.
pub enum Encryptor {
    /// Encrypt with a local secret key.
    Key(SecretKey),
    /// Custom `encrypt(plaintext, peer_public_key)` capability.
    Custom(Box<dyn Fn(&str, &PublicKey) -> Result<String, Error> + Send + Sync>),
}

impl Encryptor {
    fn encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<String, Error> {
        match self {
            Self::Key(secret_key) => {
                Ok(nip44::encrypt(secret_key, peer, plaintext, Version::default())?)
            }
            Self::Custom(encrypt) => encrypt(plaintext, peer),
        }
    }
}

impl From<SecretKey> for Encryptor {
    fn from(secret_key: SecretKey) -> Self {
        Self::Key(secret_key)
    }
}

/// Mirror of [`Encryptor`] for the listening side.
pub enum Decryptor {
    /// Decrypt with a local secret key.
    Key(SecretKey),
    /// Custom `decrypt(payload, peer_public_key)` capability.
    Custom(Box<dyn Fn(&str, &PublicKey) -> Result<String, Error> + Send + Sync>),
}

impl Decryptor {
    fn decrypt(&self, payload: &str, peer: &PublicKey) -> Result<String, Error> {
        match self {
            Self::Key(secret_key) => Ok(nip44::decrypt(secret_key, peer, payload)?),
            Self::Custom(decrypt) => decrypt(payload, peer),
        }
    }
}

impl From<SecretKey> for Decryptor {
    fn from(secret_key: SecretKey) -> Self {
        Self::Key(secret_key)
    }
}

/// Payload of an invite response, carried in the innermost encryption layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponsePayload {
    /// Fresh session key of the invitee.
    #[serde(rename = "sessionKey")]
    session_key: PublicKey,
    /// Invitee device id, when the invitee wants to be tracked per device.
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none", default)]
    device_id: Option<String>,
}

/// JSON payload of the invite URL fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UrlPayload {
    inviter: PublicKey,
    #[serde(rename = "ephemeralKey")]
    ephemeral_key: PublicKey,
    #[serde(rename = "sharedSecret", with = "serde_util::hex32")]
    shared_secret: [u8; 32],
}

/// A per-device invite: ephemeral keypair plus shared secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    /// Identity public key of the inviter.
    pub inviter: PublicKey,
    /// Public half of the inviter-controlled ephemeral key.
    pub ephemeral_public_key: PublicKey,
    /// Private half, retained only on the inviter's own device.
    #[serde(with = "serde_util::secret_key_opt", default)]
    pub ephemeral_secret_key: Option<SecretKey>,
    /// The invite link secret.
    #[serde(with = "serde_util::hex32")]
    pub shared_secret: [u8; 32],
    /// Device this invite belongs to.
    pub device_id: Option<String>,
    /// Human readable label.
    pub label: Option<String>,
    /// Maximum number of distinct identities allowed to use this invite.
    pub max_uses: Option<u32>,
    /// Identities that already used this invite.
    pub used_by: Vec<PublicKey>,
}

impl Invite {
    /// Create a fresh invite with a new ephemeral keypair and shared secret.
    pub fn new<S>(inviter: PublicKey, device_id: S) -> Self
    where
        S: Into<String>,
    {
        let ephemeral = Keys::generate();
        Self {
            inviter,
            ephemeral_public_key: ephemeral.public_key(),
            ephemeral_secret_key: Some(ephemeral.secret_key().clone()),
            shared_secret: crypto::random_secret(),
            device_id: Some(device_id.into()),
            label: None,
            max_uses: None,
            used_by: Vec::new(),
        }
    }

    /// Parse a published invite event.
    pub fn from_event(event: &Event) -> Result<Self, Error> {
        if event.kind != Kind::from(INVITE_EVENT_KIND) {
            return Err(Error::UnexpectedKind {
                expected: Kind::from(INVITE_EVENT_KIND),
                received: event.kind,
            });
        }
        if event.verify().is_err() {
            return Err(Error::MalformedEvent("invalid signature".to_string()));
        }

        let mut device_id: Option<String> = None;
        let mut ephemeral_public_key: Option<PublicKey> = None;
        let mut shared_secret: Option<[u8; 32]> = None;

        for tag in event.tags.iter() {
            let slice = tag.as_slice();
            match (slice.first().map(|name| name.as_str()), slice.get(1)) {
                (Some("d"), Some(identifier)) => {
                    device_id = identifier
                        .strip_prefix(INVITE_IDENTIFIER_PREFIX)
                        .and_then(|rest| rest.strip_prefix('/'))
                        .map(String::from);
                }
                (Some("ephemeralKey"), Some(value)) => {
                    ephemeral_public_key = PublicKey::parse(value).ok();
                }
                (Some("sharedSecret"), Some(value)) => {
                    shared_secret = hex::decode(value).ok().and_then(|bytes| bytes.try_into().ok());
                }
                _ => {}
            }
        }

        Ok(Self {
            inviter: event.pubkey,
            ephemeral_public_key: ephemeral_public_key
                .ok_or_else(|| Error::MalformedEvent("missing ephemeralKey tag".to_string()))?,
            ephemeral_secret_key: None,
            shared_secret: shared_secret
                .ok_or_else(|| Error::MalformedEvent("missing sharedSecret tag".to_string()))?,
            device_id,
            label: None,
            max_uses: None,
            used_by: Vec::new(),
        })
    }

    /// Build the publishable invite event, signed by the inviter.
    pub fn to_event(&self, keys: &Keys) -> Result<Event, Error> {
        let device_id: &str = self.device_id.as_deref().unwrap_or("default");
        let event = EventBuilder::new(Kind::from(INVITE_EVENT_KIND), "")
            .tag(Tag::identifier(format!(
                "{INVITE_IDENTIFIER_PREFIX}/{device_id}"
            )))
            .tag(Tag::custom(TagKind::custom("l"), [INVITE_IDENTIFIER_PREFIX]))
            .tag(Tag::custom(
                TagKind::custom("ephemeralKey"),
                [self.ephemeral_public_key.to_hex()],
            ))
            .tag(Tag::custom(
                TagKind::custom("sharedSecret"),
                [hex::encode(self.shared_secret)],
            ))
            .sign_with_keys(keys)?;
        Ok(event)
    }

    /// Materialize the invite as a shareable URL.
    ///
    /// All handshake material lives in the fragment, which is never sent to
    /// the server hosting `root`.
    pub fn to_url(&self, root: &str) -> Result<String, Error> {
        let payload = UrlPayload {
            inviter: self.inviter,
            ephemeral_key: self.ephemeral_public_key,
            shared_secret: self.shared_secret,
        };
        let json: String = serde_json::to_string(&payload)?;
        let encoded: String = utf8_percent_encode(&json, NON_ALPHANUMERIC).to_string();
        Ok(format!("{}#{}", root.trim_end_matches('#'), encoded))
    }

    /// Parse an invite URL produced by [`Invite::to_url`].
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let url: Url = Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let fragment: &str = url
            .fragment()
            .ok_or_else(|| Error::InvalidUrl("missing fragment".to_string()))?;
        let json = percent_decode_str(fragment)
            .decode_utf8()
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let payload: UrlPayload = serde_json::from_str(&json)?;

        Ok(Self {
            inviter: payload.inviter,
            ephemeral_public_key: payload.ephemeral_key,
            ephemeral_secret_key: None,
            shared_secret: payload.shared_secret,
            device_id: None,
            label: None,
            max_uses: None,
            used_by: Vec::new(),
        })
    }

    /// Accept the invite.
    ///
    /// Generates a fresh session key, builds the two-layer response envelope
    /// and initializes the invitee side of the session. The caller publishes
    /// the returned envelope; the session key is not recoverable if lost
    /// before the inviter replies.
    pub fn accept(
        &self,
        bus: Arc<dyn EventBus>,
        invitee_public: PublicKey,
        encryptor: Encryptor,
        device_id: Option<String>,
    ) -> Result<(Session, Event), Error> {
        let session_keys = Keys::generate();
        let payload = ResponsePayload {
            session_key: session_keys.public_key(),
            device_id,
        };
        let payload_json: String = serde_json::to_string(&payload)?;

        // Inner DH layer: binds the invitee identity to the response.
        let dh_layer: String = encryptor.encrypt(&payload_json, &self.inviter)?;
        // Link layer: anyone with the invite link can peel this, nobody else.
        let sealed: String = crypto::encrypt_with_key(&self.shared_secret, dh_layer.as_bytes())?;

        let inner: UnsignedEvent =
            EventBuilder::new(Kind::from(INVITE_RESPONSE_KIND), sealed).build(invitee_public);

        // One-shot envelope towards the inviter's ephemeral key.
        let one_shot = Keys::generate();
        let content: String = nip44::encrypt(
            one_shot.secret_key(),
            &self.ephemeral_public_key,
            serde_json::to_string(&inner)?,
            Version::default(),
        )?;
        let envelope: Event = EventBuilder::new(Kind::from(INVITE_RESPONSE_KIND), content)
            .tag(Tag::public_key(self.ephemeral_public_key))
            .custom_created_at(Timestamp::tweaked(RANGE_RANDOM_TIMESTAMP_TWEAK))
            .sign_with_keys(&one_shot)?;

        let session = Session::new(
            bus,
            self.ephemeral_public_key,
            session_keys.secret_key().clone(),
            true,
            self.shared_secret,
            envelope.id.to_hex(),
        )?;

        Ok((session, envelope))
    }

    /// Listen for responses to this invite.
    ///
    /// Requires the locally retained ephemeral private key. For every valid
    /// response, `on_session` is invoked with the responder-side session, the
    /// invitee identity and the invitee's device id, if any. Responses beyond
    /// `max_uses` distinct identities are silently ignored.
    pub fn listen<F>(
        &self,
        bus: Arc<dyn EventBus>,
        decryptor: Decryptor,
        on_session: F,
    ) -> Result<InviteListener, Error>
    where
        F: Fn(Session, PublicKey, Option<String>) + Send + Sync + 'static,
    {
        let ephemeral_secret: SecretKey = self.ephemeral_secret_key.clone().ok_or_else(|| {
            Error::MissingCapability(self.device_id.clone().unwrap_or_default())
        })?;

        let used_by: Arc<Mutex<Vec<PublicKey>>> = Arc::new(Mutex::new(self.used_by.clone()));
        let filter = Filter::new()
            .kind(Kind::from(INVITE_RESPONSE_KIND))
            .pubkey(self.ephemeral_public_key);

        let invite = self.clone();
        let callback_bus = Arc::clone(&bus);
        let callback_used = Arc::clone(&used_by);
        let subscription: Subscription = bus.subscribe(
            filter,
            Arc::new(move |event: &Event| {
                match handle_response(
                    &invite,
                    &ephemeral_secret,
                    &decryptor,
                    Arc::clone(&callback_bus),
                    &callback_used,
                    event,
                ) {
                    Ok(Some((session, invitee, device_id))) => {
                        on_session(session, invitee, device_id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(
                            target: "nostr_double_ratchet::invite::listen",
                            "Ignoring invite response {}: {e}",
                            event.id
                        );
                    }
                }
            }),
        );

        Ok(InviteListener {
            subscription,
            used_by,
        })
    }
}

/// Peel the layers of one invite response.
fn handle_response(
    invite: &Invite,
    ephemeral_secret: &SecretKey,
    decryptor: &Decryptor,
    bus: Arc<dyn EventBus>,
    used_by: &Mutex<Vec<PublicKey>>,
    event: &Event,
) -> Result<Option<(Session, PublicKey, Option<String>)>, Error> {
    if event.kind != Kind::from(INVITE_RESPONSE_KIND) {
        return Ok(None);
    }

    let sealed: String = nip44::decrypt(ephemeral_secret, &event.pubkey, &event.content)?;
    let inner: UnsignedEvent = serde_json::from_str(&sealed)?;
    let invitee: PublicKey = inner.pubkey;

    let dh_layer: String = String::from_utf8(crypto::decrypt_with_key(
        &invite.shared_secret,
        &inner.content,
    )?)
    .map_err(|_| Error::MalformedEvent("response layer is not UTF-8".to_string()))?;

    let payload_json: String = decryptor.decrypt(&dh_layer, &invitee)?;
    let payload: ResponsePayload = match serde_json::from_str(&payload_json) {
        Ok(payload) => payload,
        // Plain-string responses carry just the session key.
        Err(_) => ResponsePayload {
            session_key: PublicKey::parse(payload_json.trim())
                .map_err(|e| Error::MalformedEvent(e.to_string()))?,
            device_id: None,
        },
    };

    {
        let mut used: MutexGuard<Vec<PublicKey>> = match used_by.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !used.contains(&invitee) {
            if let Some(max_uses) = invite.max_uses {
                if used.len() as u32 >= max_uses {
                    tracing::debug!(
                        target: "nostr_double_ratchet::invite::listen",
                        "Invite exhausted, ignoring response from {invitee}"
                    );
                    return Ok(None);
                }
            }
            used.push(invitee);
        }
    }

    let session = Session::new(
        bus,
        payload.session_key,
        ephemeral_secret.clone(),
        false,
        invite.shared_secret,
        event.id.to_hex(),
    )?;

    Ok(Some((session, invitee, payload.device_id)))
}

/// Active invite listener; dropping it stops listening.
#[derive(Debug)]
pub struct InviteListener {
    subscription: Subscription,
    used_by: Arc<Mutex<Vec<PublicKey>>>,
}

impl InviteListener {
    /// Identities that used the invite so far.
    pub fn used_by(&self) -> Vec<PublicKey> {
        match self.used_by.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop listening.
    pub fn stop(&self) {
        self.subscription.cancel();
    }
}
