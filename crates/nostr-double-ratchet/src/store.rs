//! Persistence
//!
//! A small key-value [`Storage`] adapter contract plus the [`UserRecordStore`]
//! that persists [`UserRecord`]s under it and revives their sessions against
//! an event bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use nostr::PublicKey;
use serde_json::Value;

use crate::bus::EventBus;
use crate::constant::STORAGE_VERSION;
use crate::device::UserRecord;
use crate::error::Error;
use crate::session::Session;

/// Key-value storage adapter. Values are JSON.
pub trait Storage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<Value>, Error>;
    /// Write a value.
    fn put(&self, key: &str, value: Value) -> Result<(), Error>;
    /// Delete a value.
    fn del(&self, key: &str) -> Result<(), Error>;
    /// List all keys starting with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// In-memory [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    /// New empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), Error> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), Error> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(lock(&self.entries)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Owns the `identity -> UserRecord` map and its persistence.
pub struct UserRecordStore<S>
where
    S: Storage,
{
    storage: S,
    version: String,
    users: Mutex<HashMap<PublicKey, UserRecord>>,
}

impl<S> UserRecordStore<S>
where
    S: Storage,
{
    /// New store over a storage adapter.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            version: STORAGE_VERSION.to_string(),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying storage adapter.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn key(&self, public_key: &PublicKey) -> String {
        format!("{}/user/{}", self.version, public_key.to_hex())
    }

    /// Snapshot of the record for `public_key`, lazily created.
    pub fn get_or_create(&self, public_key: PublicKey) -> UserRecord {
        lock(&self.users)
            .entry(public_key)
            .or_insert_with(|| UserRecord::new(public_key))
            .clone()
    }

    /// Mutate the record for `public_key` in place, lazily created.
    pub fn update<F, R>(&self, public_key: PublicKey, f: F) -> R
    where
        F: FnOnce(&mut UserRecord) -> R,
    {
        let mut users = lock(&self.users);
        let record = users
            .entry(public_key)
            .or_insert_with(|| UserRecord::new(public_key));
        f(record)
    }

    /// Persist the record for `public_key`.
    pub fn save(&self, public_key: &PublicKey) -> Result<(), Error> {
        let record: UserRecord = lock(&self.users)
            .get(public_key)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("unknown user: {public_key}")))?;
        self.storage.put(&self.key(public_key), serde_json::to_value(&record)?)
    }

    /// Load the record for `public_key`, reviving its sessions against `bus`.
    ///
    /// Returns the revived sessions, active ones first per device.
    pub fn load(
        &self,
        public_key: &PublicKey,
        bus: Arc<dyn EventBus>,
    ) -> Result<Vec<Session>, Error> {
        let Some(value) = self.storage.get(&self.key(public_key))? else {
            return Ok(Vec::new());
        };
        let record: UserRecord = serde_json::from_value(value)?;

        let mut sessions: Vec<Session> = Vec::new();
        for device in record.devices.values() {
            for stored in device.sessions() {
                sessions.push(Session::from_state(
                    Arc::clone(&bus),
                    stored.state.clone(),
                    stored.name.clone(),
                ));
            }
        }

        lock(&self.users).insert(*public_key, record);
        Ok(sessions)
    }

    /// Load every persisted user record, reviving all sessions against `bus`.
    pub fn load_all(
        &self,
        bus: Arc<dyn EventBus>,
    ) -> Result<Vec<(PublicKey, Vec<Session>)>, Error> {
        let prefix = format!("{}/user/", self.version);
        let mut out: Vec<(PublicKey, Vec<Session>)> = Vec::new();

        for key in self.storage.list(&prefix)? {
            let Some(identity) = key.strip_prefix(&prefix) else {
                continue;
            };
            let public_key = PublicKey::parse(identity)
                .map_err(|e| Error::Storage(format!("bad storage key {key}: {e}")))?;
            out.push((public_key, self.load(&public_key, Arc::clone(&bus))?));
        }

        Ok(out)
    }

    /// Delete the persisted record for `public_key`.
    pub fn delete(&self, public_key: &PublicKey) -> Result<(), Error> {
        lock(&self.users).remove(public_key);
        self.storage.del(&self.key(public_key))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
