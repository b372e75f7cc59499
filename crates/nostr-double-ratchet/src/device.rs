//! Device and user records
//!
//! Bookkeeping of ratchet sessions per (peer identity, device). Sessions
//! rotate: a fresher session demotes the previous active one into a short
//! list of inactive sessions that can still decrypt stragglers.

use std::collections::BTreeMap;

use nostr::{PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

use crate::constant::MAX_INACTIVE_SESSIONS;
use crate::state::SessionState;

/// A session in its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Session name; sessions with the same name replace each other in place.
    pub name: String,
    /// The ratchet state.
    pub state: SessionState,
}

/// One known device of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id.
    pub device_id: String,
    /// The session currently used with this device.
    pub active_session: Option<StoredSession>,
    /// Recently demoted sessions, newest first.
    pub inactive_sessions: Vec<StoredSession>,
    /// When the device was first seen.
    pub created_at: Timestamp,
    /// When the device was marked stale, if ever.
    pub stale_at: Option<Timestamp>,
}

impl DeviceRecord {
    /// Record a newly seen device.
    pub fn new<S>(device_id: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            device_id: device_id.into(),
            active_session: None,
            inactive_sessions: Vec::new(),
            created_at: Timestamp::now(),
            stale_at: None,
        }
    }

    /// Install `next` as the active session.
    ///
    /// A session with the same name as the active one replaces it in place;
    /// otherwise the previous active session is demoted and the inactive list
    /// trimmed to its bound, oldest dropped.
    pub fn rotate_session(&mut self, next: StoredSession) {
        match self.active_session.take() {
            None => self.active_session = Some(next),
            Some(active) if active.name == next.name => self.active_session = Some(next),
            Some(active) => {
                self.inactive_sessions.insert(0, active);
                self.inactive_sessions.truncate(MAX_INACTIVE_SESSIONS);
                self.active_session = Some(next);
            }
        }
        self.stale_at = None;
    }

    /// Mark the device stale.
    pub fn mark_stale(&mut self) {
        if self.stale_at.is_none() {
            self.stale_at = Some(Timestamp::now());
        }
    }

    /// All stored sessions, active first.
    pub fn sessions(&self) -> impl Iterator<Item = &StoredSession> {
        self.active_session.iter().chain(self.inactive_sessions.iter())
    }
}

/// Everything known about one peer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Peer identity public key.
    pub public_key: PublicKey,
    /// Known devices by id.
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl UserRecord {
    /// New empty record.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            devices: BTreeMap::new(),
        }
    }

    /// Look up a device record, creating it on first contact.
    pub fn device_mut<S>(&mut self, device_id: S) -> &mut DeviceRecord
    where
        S: Into<String>,
    {
        let device_id: String = device_id.into();
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceRecord::new(device_id))
    }

    /// Install a session for a device, rotating as needed.
    pub fn rotate_session<S>(&mut self, device_id: S, next: StoredSession)
    where
        S: Into<String>,
    {
        self.device_mut(device_id).rotate_session(next);
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;

    use super::*;

    fn stored(name: &str) -> StoredSession {
        let ours = Keys::generate();
        let theirs = Keys::generate();
        StoredSession {
            name: name.to_string(),
            state: SessionState::new(
                theirs.public_key(),
                ours.secret_key().clone(),
                true,
                [0u8; 32],
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_first_session_installs() {
        let mut record = DeviceRecord::new("laptop");
        record.rotate_session(stored("a"));

        assert_eq!(record.active_session.as_ref().unwrap().name, "a");
        assert!(record.inactive_sessions.is_empty());
    }

    #[test]
    fn test_same_name_replaces_in_place() {
        let mut record = DeviceRecord::new("laptop");
        record.rotate_session(stored("a"));
        let replacement = stored("a");
        let replacement_state = replacement.state.clone();
        record.rotate_session(replacement);

        assert_eq!(record.active_session.as_ref().unwrap().state, replacement_state);
        assert!(record.inactive_sessions.is_empty());
    }

    #[test]
    fn test_fresher_session_demotes_the_active_one() {
        let mut record = DeviceRecord::new("laptop");
        record.rotate_session(stored("a"));
        record.rotate_session(stored("b"));

        assert_eq!(record.active_session.as_ref().unwrap().name, "b");
        assert_eq!(record.inactive_sessions.len(), 1);
        assert_eq!(record.inactive_sessions[0].name, "a");

        // The inactive list stays bounded, oldest dropped.
        record.rotate_session(stored("c"));
        assert_eq!(record.active_session.as_ref().unwrap().name, "c");
        assert_eq!(record.inactive_sessions.len(), 1);
        assert_eq!(record.inactive_sessions[0].name, "b");
    }

    #[test]
    fn test_user_record_creates_devices_lazily() {
        let peer = Keys::generate();
        let mut user = UserRecord::new(peer.public_key());

        user.rotate_session("laptop", stored("a"));
        user.rotate_session("phone", stored("b"));

        assert_eq!(user.devices.len(), 2);
        assert_eq!(
            user.devices.get("laptop").unwrap().active_session.as_ref().unwrap().name,
            "a"
        );
    }
}
