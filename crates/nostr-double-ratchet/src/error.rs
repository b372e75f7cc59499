//! Error

use std::fmt;

use nostr::event::builder;
use nostr::nips::nip44;
use nostr::{event, key, secp256k1, Kind};

/// Double ratchet error
#[derive(Debug)]
pub enum Error {
    /// NIP-44 error (AEAD tag mismatch, header decryption failure, ...)
    Crypto(nip44::Error),
    /// Keys error
    Key(key::Error),
    /// Event builder error
    EventBuilder(builder::Error),
    /// Event error
    Event(event::Error),
    /// Secp256k1 error
    Secp256k1(secp256k1::Error),
    /// JSON (de)serialization error
    Json(serde_json::Error),
    /// Event is missing required tags, carries malformed ones or a bad signature
    MalformedEvent(String),
    /// Unexpected event kind
    UnexpectedKind {
        /// Expected kind
        expected: Kind,
        /// Received kind
        received: Kind,
    },
    /// Invite URL is missing its fragment or carries malformed JSON
    InvalidUrl(String),
    /// Referenced device is not part of the invite list
    UnknownDevice(String),
    /// The ephemeral private key of the device was not retained locally
    MissingCapability(String),
    /// Skipped-key cache bound exceeded
    BoundExceeded,
    /// The current state does not allow the requested transition
    InvalidState(&'static str),
    /// Storage adapter failure
    Storage(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "{e}"),
            Self::Key(e) => write!(f, "{e}"),
            Self::EventBuilder(e) => write!(f, "{e}"),
            Self::Event(e) => write!(f, "{e}"),
            Self::Secp256k1(e) => write!(f, "{e}"),
            Self::Json(e) => write!(f, "{e}"),
            Self::MalformedEvent(reason) => write!(f, "malformed event: {reason}"),
            Self::UnexpectedKind { expected, received } => write!(
                f,
                "unexpected event kind: expected={}, received={}",
                expected.as_u16(),
                received.as_u16()
            ),
            Self::InvalidUrl(reason) => write!(f, "invalid invite url: {reason}"),
            Self::UnknownDevice(id) => write!(f, "unknown device: {id}"),
            Self::MissingCapability(id) => {
                write!(f, "ephemeral private key not available for device: {id}")
            }
            Self::BoundExceeded => write!(f, "skipped-key cache bound exceeded"),
            Self::InvalidState(reason) => write!(f, "invalid session state: {reason}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl Error {
    /// Whether this error is a swallowed-class crypto failure (invalid mac,
    /// failed to decrypt header, ...) rather than a protocol or caller error.
    #[inline]
    pub fn is_crypto_failure(&self) -> bool {
        matches!(self, Self::Crypto(..))
    }
}

impl From<nip44::Error> for Error {
    fn from(e: nip44::Error) -> Self {
        Self::Crypto(e)
    }
}

impl From<key::Error> for Error {
    fn from(e: key::Error) -> Self {
        Self::Key(e)
    }
}

impl From<builder::Error> for Error {
    fn from(e: builder::Error) -> Self {
        Self::EventBuilder(e)
    }
}

impl From<event::Error> for Error {
    fn from(e: event::Error) -> Self {
        Self::Event(e)
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Self::Secp256k1(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
