//! Serde helpers
//!
//! Key material is persisted as hex strings, matching the event wire format.

use hex;

pub(crate) fn encode32(key: &[u8; 32]) -> String {
    hex::encode(key)
}

pub(crate) fn decode32<E>(value: &str) -> Result<[u8; 32], E>
where
    E: serde::de::Error,
{
    let bytes: Vec<u8> = hex::decode(value).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|_| E::custom("expected 32 bytes of hex"))
}

pub(crate) mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode32(key))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        super::decode32(&value)
    }
}

pub(crate) mod hex32_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(key: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match key {
            Some(key) => serializer.serialize_some(&super::encode32(key)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(value) => Ok(Some(super::decode32(&value)?)),
            None => Ok(None),
        }
    }
}

pub(crate) mod hex32_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(keys: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(keys.iter().map(super::encode32))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<String>::deserialize(deserializer)?;
        values.iter().map(|value| super::decode32(value)).collect()
    }
}

pub(crate) mod hex32_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(
        keys: &BTreeMap<u32, [u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(keys.iter().map(|(n, key)| (n, super::encode32(key))))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u32, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = BTreeMap::<u32, String>::deserialize(deserializer)?;
        values
            .into_iter()
            .map(|(n, value)| Ok((n, super::decode32(&value)?)))
            .collect()
    }
}

pub(crate) mod keys {
    use nostr::{Keys, SecretKey};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(keys: &Keys, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&keys.secret_key().to_secret_hex())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Keys, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let secret_key = SecretKey::from_hex(&value).map_err(D::Error::custom)?;
        Ok(Keys::new(secret_key))
    }
}

pub(crate) mod keys_opt {
    use nostr::{Keys, SecretKey};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(keys: &Option<Keys>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match keys {
            Some(keys) => serializer.serialize_some(&keys.secret_key().to_secret_hex()),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Keys>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(value) => {
                let secret_key = SecretKey::from_hex(&value).map_err(D::Error::custom)?;
                Ok(Some(Keys::new(secret_key)))
            }
            None => Ok(None),
        }
    }
}

pub(crate) mod secret_key_opt {
    use nostr::SecretKey;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(
        secret_key: &Option<SecretKey>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret_key {
            Some(secret_key) => serializer.serialize_some(&secret_key.to_secret_hex()),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretKey>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(value) => Ok(Some(SecretKey::from_hex(&value).map_err(D::Error::custom)?)),
            None => Ok(None),
        }
    }
}
