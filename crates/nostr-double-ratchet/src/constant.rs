//! Protocol constants
//!
//! The event kinds are deployment-configured values; every participant of a
//! deployment must agree on them.

/// Kind of the outer events carrying ratcheted message ciphertexts.
pub const MESSAGE_EVENT_KIND: u16 = 1060;

/// Kind of the one-shot envelopes answering an invite.
pub const INVITE_RESPONSE_KIND: u16 = 1059;

/// Kind of published per-device invite events (NIP-78 application data).
pub const INVITE_EVENT_KIND: u16 = 30078;

/// Kind of the owner's replaceable invite list event.
pub const INVITE_LIST_KIND: u16 = 10078;

/// `d` tag identifier of the replaceable invite list event.
pub const INVITE_LIST_IDENTIFIER: &str = "double-ratchet/invite-list";

/// Prefix of the `d` tag identifier of per-device invite events.
pub const INVITE_IDENTIFIER_PREFIX: &str = "double-ratchet/invites";

/// Name of the tag carrying the encrypted message header.
pub const HEADER_TAG: &str = "header";

/// Max number of message keys derived ahead within a single receiving chain.
pub const MAX_SKIP: u32 = 1000;

/// Aggregate cap on cached skipped message keys per session.
///
/// When exceeded, whole cache entries are evicted in insertion order.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Max number of inactive sessions retained per device record.
pub const MAX_INACTIVE_SESSIONS: usize = 1;

/// Version prefix of the persisted storage layout.
pub const STORAGE_VERSION: &str = "v1";
