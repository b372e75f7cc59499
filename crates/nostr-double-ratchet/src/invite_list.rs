//! Invite list
//!
//! The owner-side registry of per-device invites, published as a single
//! replaceable event (the bus keeps only the newest one per owner). Removed
//! device ids are kept as tombstones so that two divergent copies of the list
//! can always be merged back together.

use std::collections::BTreeMap;
use std::sync::Arc;

use hex;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, SecretKey, Tag, TagKind, Timestamp};
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::constant::{INVITE_LIST_IDENTIFIER, INVITE_LIST_KIND};
use crate::crypto;
use crate::error::Error;
use crate::invite::{Decryptor, Encryptor, Invite, InviteListener};
use crate::serde_util;
use crate::session::Session;

/// One device of the owner, with its invite material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Public half of the device's invite ephemeral key.
    pub ephemeral_public_key: PublicKey,
    /// Private half, retained only on the device itself. Never part of the
    /// published event.
    #[serde(with = "serde_util::secret_key_opt", default)]
    pub ephemeral_secret_key: Option<SecretKey>,
    /// The invite link secret of this device.
    #[serde(with = "serde_util::hex32")]
    pub shared_secret: [u8; 32],
    /// Device id.
    pub device_id: String,
    /// Human readable label.
    pub label: Option<String>,
}

impl DeviceEntry {
    /// Create an entry with fresh invite material.
    pub fn new<S>(device_id: S, label: Option<String>) -> Self
    where
        S: Into<String>,
    {
        let ephemeral = Keys::generate();
        Self {
            ephemeral_public_key: ephemeral.public_key(),
            ephemeral_secret_key: Some(ephemeral.secret_key().clone()),
            shared_secret: crypto::random_secret(),
            device_id: device_id.into(),
            label,
        }
    }

    /// The invite this entry advertises.
    pub fn invite(&self, inviter: PublicKey) -> Invite {
        Invite {
            inviter,
            ephemeral_public_key: self.ephemeral_public_key,
            ephemeral_secret_key: self.ephemeral_secret_key.clone(),
            shared_secret: self.shared_secret,
            device_id: Some(self.device_id.clone()),
            label: self.label.clone(),
            max_uses: None,
            used_by: Vec::new(),
        }
    }
}

/// A removed device tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedDevice {
    /// Device id.
    pub device_id: String,
    /// When the device was removed, in whole seconds.
    pub removed_at: Timestamp,
}

/// The owner's device registry, serialized as one replaceable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteList {
    /// Identity public key of the owner.
    pub owner: PublicKey,
    devices: BTreeMap<String, DeviceEntry>,
    removed: Vec<RemovedDevice>,
    main_device_id: Option<String>,
    version: u32,
    created_at: Timestamp,
}

impl InviteList {
    /// Create an empty list.
    pub fn new(owner: PublicKey) -> Self {
        Self {
            owner,
            devices: BTreeMap::new(),
            removed: Vec::new(),
            main_device_id: None,
            version: 1,
            created_at: Timestamp::now(),
        }
    }

    /// Parse and verify a published invite list event.
    ///
    /// Malformed `device` and `removed` tags are silently dropped.
    pub fn from_event(event: &Event) -> Result<Self, Error> {
        if event.kind != Kind::from(INVITE_LIST_KIND) {
            return Err(Error::UnexpectedKind {
                expected: Kind::from(INVITE_LIST_KIND),
                received: event.kind,
            });
        }
        if event.verify().is_err() {
            return Err(Error::MalformedEvent("invalid signature".to_string()));
        }

        let mut identifier: Option<&str> = None;
        let mut devices: BTreeMap<String, DeviceEntry> = BTreeMap::new();
        let mut removed: BTreeMap<String, Timestamp> = BTreeMap::new();
        let mut main_device_id: Option<String> = None;
        let mut version: u32 = 1;

        for tag in event.tags.iter() {
            match tag.as_slice() {
                [name, value, ..] if name == "d" => {
                    identifier = Some(value.as_str());
                }
                [name, ephemeral, secret, device_id, rest @ ..] if name == "device" => {
                    let Ok(ephemeral_public_key) = PublicKey::parse(ephemeral) else {
                        continue;
                    };
                    let Some(shared_secret) = hex::decode(secret)
                        .ok()
                        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
                    else {
                        continue;
                    };
                    let label: Option<String> =
                        rest.first().filter(|label| !label.is_empty()).cloned();
                    devices.insert(
                        device_id.clone(),
                        DeviceEntry {
                            ephemeral_public_key,
                            ephemeral_secret_key: None,
                            shared_secret,
                            device_id: device_id.clone(),
                            label,
                        },
                    );
                }
                [name, device_id, timestamp, ..] if name == "removed" => {
                    let Ok(timestamp) = timestamp.parse::<u64>() else {
                        continue;
                    };
                    removed.insert(device_id.clone(), Timestamp::from(timestamp));
                }
                [name, device_id, ..] if name == "main-device" => {
                    main_device_id = Some(device_id.clone());
                }
                [name, value, ..] if name == "version" => {
                    if let Ok(value) = value.parse::<u32>() {
                        version = value;
                    }
                }
                _ => {}
            }
        }

        if identifier != Some(INVITE_LIST_IDENTIFIER) {
            return Err(Error::MalformedEvent(
                "missing invite list identifier".to_string(),
            ));
        }

        // A removed id never stays active.
        devices.retain(|device_id, _| !removed.contains_key(device_id));

        Ok(Self {
            owner: event.pubkey,
            devices,
            removed: removed
                .into_iter()
                .map(|(device_id, removed_at)| RemovedDevice {
                    device_id,
                    removed_at,
                })
                .collect(),
            main_device_id,
            version,
            created_at: event.created_at,
        })
    }

    /// Build the canonical replaceable event, signed by the owner.
    pub fn to_event(&self, keys: &Keys) -> Result<Event, Error> {
        if keys.public_key() != self.owner {
            return Err(Error::InvalidState("signing keys do not match the list owner"));
        }

        let mut builder = EventBuilder::new(Kind::from(INVITE_LIST_KIND), "")
            .tag(Tag::identifier(INVITE_LIST_IDENTIFIER));

        for entry in self.devices.values() {
            builder = builder.tag(Tag::custom(
                TagKind::custom("device"),
                [
                    entry.ephemeral_public_key.to_hex(),
                    hex::encode(entry.shared_secret),
                    entry.device_id.clone(),
                    entry.label.clone().unwrap_or_default(),
                ],
            ));
        }
        for tombstone in self.removed.iter() {
            builder = builder.tag(Tag::custom(
                TagKind::custom("removed"),
                [
                    tombstone.device_id.clone(),
                    tombstone.removed_at.as_u64().to_string(),
                ],
            ));
        }
        if let Some(main_device_id) = &self.main_device_id {
            builder = builder.tag(Tag::custom(
                TagKind::custom("main-device"),
                [main_device_id.clone()],
            ));
        }
        builder = builder.tag(Tag::custom(
            TagKind::custom("version"),
            [self.version.to_string()],
        ));

        Ok(builder.custom_created_at(self.created_at).sign_with_keys(keys)?)
    }

    /// Active devices.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    /// Look up an active device.
    pub fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    /// Removed device tombstones.
    pub fn removed(&self) -> &[RemovedDevice] {
        &self.removed
    }

    /// The designated main device, if any.
    pub fn main_device_id(&self) -> Option<&str> {
        self.main_device_id.as_deref()
    }

    /// Designate a main device.
    pub fn set_main_device_id<S>(&mut self, device_id: S)
    where
        S: Into<String>,
    {
        self.main_device_id = Some(device_id.into());
        self.created_at = Timestamp::now();
    }

    /// When the list was last modified.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Add a device. A no-op for any id that was removed before.
    pub fn add_device(&mut self, entry: DeviceEntry) {
        if self.is_removed(&entry.device_id) {
            tracing::debug!(
                target: "nostr_double_ratchet::invite_list::add_device",
                "Ignoring removed device id {}",
                entry.device_id
            );
            return;
        }
        self.devices.insert(entry.device_id.clone(), entry);
        self.created_at = Timestamp::now();
    }

    /// Remove a device, leaving a tombstone behind.
    pub fn remove_device(&mut self, device_id: &str) {
        self.devices.remove(device_id);

        let removed_at = Timestamp::now();
        match self
            .removed
            .iter_mut()
            .find(|tombstone| tombstone.device_id == device_id)
        {
            Some(tombstone) => tombstone.removed_at = removed_at,
            None => self.removed.push(RemovedDevice {
                device_id: device_id.to_string(),
                removed_at,
            }),
        }
        self.created_at = removed_at;
    }

    fn is_removed(&self, device_id: &str) -> bool {
        self.removed
            .iter()
            .any(|tombstone| tombstone.device_id == device_id)
    }

    /// Merge two copies of the registry.
    ///
    /// Commutative and idempotent over the observable fields: the set of
    /// active devices and the set of removed ids.
    pub fn merge(&self, other: &Self) -> Self {
        let (newer, older) = if self.created_at >= other.created_at {
            (self, other)
        } else {
            (other, self)
        };

        // Tombstones: union, deduped by id, keeping the latest timestamp.
        let mut removed: BTreeMap<String, Timestamp> = BTreeMap::new();
        for tombstone in self.removed.iter().chain(other.removed.iter()) {
            removed
                .entry(tombstone.device_id.clone())
                .and_modify(|removed_at| *removed_at = (*removed_at).max(tombstone.removed_at))
                .or_insert(tombstone.removed_at);
        }

        // Devices: the newer input wins per id; a locally retained ephemeral
        // private key survives the merge when the entry is otherwise equal.
        let mut devices: BTreeMap<String, DeviceEntry> = older.devices.clone();
        for (device_id, entry) in newer.devices.iter() {
            let mut entry = entry.clone();
            if entry.ephemeral_secret_key.is_none() {
                if let Some(existing) = devices.get(device_id) {
                    if existing.ephemeral_public_key == entry.ephemeral_public_key {
                        entry.ephemeral_secret_key = existing.ephemeral_secret_key.clone();
                    }
                }
            }
            devices.insert(device_id.clone(), entry);
        }
        devices.retain(|device_id, _| !removed.contains_key(device_id));

        Self {
            owner: newer.owner,
            devices,
            removed: removed
                .into_iter()
                .map(|(device_id, removed_at)| RemovedDevice {
                    device_id,
                    removed_at,
                })
                .collect(),
            main_device_id: newer.main_device_id.clone(),
            version: self.version.max(other.version),
            created_at: newer.created_at,
        }
    }

    /// Accept the invite of one of the listed devices.
    pub fn accept(
        &self,
        device_id: &str,
        bus: Arc<dyn EventBus>,
        invitee_public: PublicKey,
        encryptor: Encryptor,
        own_device_id: Option<String>,
    ) -> Result<(Session, Event), Error> {
        let entry = self
            .devices
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        entry
            .invite(self.owner)
            .accept(bus, invitee_public, encryptor, own_device_id)
    }

    /// Listen for responses to the invite of one of the listed devices.
    ///
    /// Fails with [`Error::MissingCapability`] if the device's ephemeral
    /// private key was not retained locally.
    pub fn listen<F>(
        &self,
        device_id: &str,
        bus: Arc<dyn EventBus>,
        decryptor: Decryptor,
        on_session: F,
    ) -> Result<InviteListener, Error>
    where
        F: Fn(Session, PublicKey, Option<String>) + Send + Sync + 'static,
    {
        let entry = self
            .devices
            .get(device_id)
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        entry.invite(self.owner).listen(bus, decryptor, on_session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bus::MemoryBus;

    fn observable(list: &InviteList) -> (Vec<String>, Vec<String>) {
        let mut active: Vec<String> = list.devices().map(|entry| entry.device_id.clone()).collect();
        let mut removed: Vec<String> = list
            .removed()
            .iter()
            .map(|tombstone| tombstone.device_id.clone())
            .collect();
        active.sort();
        removed.sort();
        (active, removed)
    }

    #[test]
    fn test_event_roundtrip() {
        let owner = Keys::generate();
        let mut list = InviteList::new(owner.public_key());
        list.add_device(DeviceEntry::new("laptop", Some("Laptop".to_string())));
        list.add_device(DeviceEntry::new("phone", None));
        list.remove_device("tablet");
        list.set_main_device_id("laptop");

        let event = list.to_event(&owner).unwrap();
        let parsed = InviteList::from_event(&event).unwrap();

        assert_eq!(parsed.owner, owner.public_key());
        assert_eq!(observable(&parsed), observable(&list));
        assert_eq!(parsed.main_device_id(), Some("laptop"));
        assert_eq!(parsed.version, 1);
        // Private halves never travel in the event.
        assert!(parsed.devices().all(|entry| entry.ephemeral_secret_key.is_none()));
        assert_eq!(
            parsed.device("laptop").unwrap().ephemeral_public_key,
            list.device("laptop").unwrap().ephemeral_public_key
        );
    }

    #[test]
    fn test_malformed_tags_are_dropped() {
        let owner = Keys::generate();
        let event = EventBuilder::new(Kind::from(INVITE_LIST_KIND), "")
            .tag(Tag::identifier(INVITE_LIST_IDENTIFIER))
            .tag(Tag::custom(TagKind::custom("device"), ["not-a-key"]))
            .tag(Tag::custom(
                TagKind::custom("device"),
                ["not-a-key", "not-hex", "ghost", ""],
            ))
            .tag(Tag::custom(TagKind::custom("removed"), ["ghost", "not-a-ts"]))
            .sign_with_keys(&owner)
            .unwrap();

        let parsed = InviteList::from_event(&event).unwrap();
        assert_eq!(parsed.devices().count(), 0);
        assert!(parsed.removed().is_empty());
    }

    #[test]
    fn test_unsigned_or_foreign_kind_is_rejected() {
        let owner = Keys::generate();
        let wrong_kind = EventBuilder::new(Kind::from(1), "")
            .sign_with_keys(&owner)
            .unwrap();
        assert!(matches!(
            InviteList::from_event(&wrong_kind),
            Err(Error::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_removed_id_cannot_be_added_back() {
        let owner = Keys::generate();
        let mut list = InviteList::new(owner.public_key());

        list.add_device(DeviceEntry::new("laptop", None));
        list.remove_device("laptop");
        list.add_device(DeviceEntry::new("laptop", None));

        assert!(list.device("laptop").is_none());
        assert_eq!(list.removed().len(), 1);
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let owner = Keys::generate();

        let mut a = InviteList::new(owner.public_key());
        a.add_device(DeviceEntry::new("laptop", None));
        a.add_device(DeviceEntry::new("phone", None));
        a.remove_device("phone");
        a.created_at = Timestamp::from(1_000);

        let mut b = InviteList::new(owner.public_key());
        b.add_device(DeviceEntry::new("phone", None));
        b.add_device(DeviceEntry::new("tablet", None));
        b.created_at = Timestamp::from(2_000);

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(observable(&ab), observable(&ba));
        assert_eq!(observable(&ab.merge(&ab)), observable(&ab));

        // The phone tombstone wins over b's active phone entry.
        assert!(ab.device("phone").is_none());
        assert!(ab.device("laptop").is_some());
        assert!(ab.device("tablet").is_some());
    }

    #[test]
    fn test_merge_keeps_local_private_key() {
        let owner = Keys::generate();

        let mut local = InviteList::new(owner.public_key());
        local.add_device(DeviceEntry::new("laptop", None));
        local.created_at = Timestamp::from(1_000);

        // The published copy of the same list, freshly parsed: no secrets.
        let mut remote = local.clone();
        for entry in remote.devices.values_mut() {
            entry.ephemeral_secret_key = None;
        }
        remote.created_at = Timestamp::from(2_000);

        let merged = local.merge(&remote);
        assert!(merged.device("laptop").unwrap().ephemeral_secret_key.is_some());
    }

    #[test]
    fn test_handshake_through_the_list() {
        let bus = Arc::new(MemoryBus::new());
        let owner = Keys::generate();
        let invitee = Keys::generate();

        let mut list = InviteList::new(owner.public_key());
        list.add_device(DeviceEntry::new("laptop", None));

        let sessions: Arc<Mutex<Vec<(Session, PublicKey, Option<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sessions);
        let _listener = list
            .listen(
                "laptop",
                bus.clone(),
                Decryptor::Key(owner.secret_key().clone()),
                move |session, invitee, device_id| {
                    sink.lock().unwrap().push((session, invitee, device_id));
                },
            )
            .unwrap();

        let (invitee_session, envelope) = list
            .accept(
                "laptop",
                bus.clone(),
                invitee.public_key(),
                Encryptor::Key(invitee.secret_key().clone()),
                Some("invitee-phone".to_string()),
            )
            .unwrap();
        bus.publish(envelope);

        let guard = sessions.lock().unwrap();
        let (inviter_session, seen_invitee, seen_device) = guard.first().unwrap();
        assert_eq!(*seen_invitee, invitee.public_key());
        assert_eq!(seen_device.as_deref(), Some("invitee-phone"));

        let output = invitee_session.send("Hello from invitee!").unwrap();
        assert_eq!(
            inviter_session.decrypt_event(&output.event).unwrap().content,
            "Hello from invitee!"
        );

        let output = inviter_session.send("Hello back!").unwrap();
        assert_eq!(
            invitee_session.decrypt_event(&output.event).unwrap().content,
            "Hello back!"
        );
    }

    #[test]
    fn test_unknown_device_is_surfaced() {
        let bus: Arc<MemoryBus> = Arc::new(MemoryBus::new());
        let owner = Keys::generate();
        let invitee = Keys::generate();
        let list = InviteList::new(owner.public_key());

        let result = list.accept(
            "ghost",
            bus,
            invitee.public_key(),
            Encryptor::Key(invitee.secret_key().clone()),
            None,
        );
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
    }
}
