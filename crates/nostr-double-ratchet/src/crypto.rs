//! Ratchet primitives
//!
//! KDF chains for root/sending/receiving ratchets, conversation-key DH and
//! keyed NIP-44 encryption. All parties of a deployment must agree on these
//! constructions.

use nostr::hashes::Hash;
use nostr::nips::nip44::{self, Version};
use nostr::util::{generate_shared_key, hkdf};
use nostr::{Keys, PublicKey, SecretKey};

use crate::error::Error;

/// HKDF domain separation info.
const KDF_INFO: &[u8] = b"nostr-double-ratchet";

/// Salt of the symmetric chain step.
const CHAIN_STEP_SALT: &[u8] = b"nostr-double-ratchet/chain";

/// HKDF-SHA256: extract with `salt`, expand `KDF_INFO` into `N` 32-byte outputs.
fn kdf<const N: usize>(input: &[u8], salt: &[u8]) -> [[u8; 32]; N] {
    let prk = hkdf::extract(salt, input);
    let okm: Vec<u8> = hkdf::expand(&prk.to_byte_array(), KDF_INFO, 32 * N);

    let mut out = [[0u8; 32]; N];
    for (chunk, key) in okm.chunks_exact(32).zip(out.iter_mut()) {
        key.copy_from_slice(chunk);
    }
    out
}

/// Derive the first root key by mixing the invite shared secret into the
/// identity DH output.
pub(crate) fn initial_root_key(dh: &[u8; 32], shared_secret: &[u8; 32]) -> [u8; 32] {
    let [root_key] = kdf::<1>(dh, shared_secret);
    root_key
}

/// Root ratchet step: mix a fresh DH output into the root key, yielding the
/// next root key, the new chain key and the header key of the new chain.
pub(crate) fn root_step(root_key: &[u8; 32], dh: &[u8; 32]) -> ([u8; 32], [u8; 32], [u8; 32]) {
    let [next_root_key, chain_key, header_key] = kdf::<3>(dh, root_key);
    (next_root_key, chain_key, header_key)
}

/// Symmetric chain step: advance the chain key and derive one message key.
pub(crate) fn chain_step(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let [next_chain_key, message_key] = kdf::<2>(chain_key, CHAIN_STEP_SALT);
    (next_chain_key, message_key)
}

/// Conversation-key ECDH between a secret and a public key.
pub(crate) fn conversation_key(
    secret_key: &SecretKey,
    public_key: &PublicKey,
) -> Result<[u8; 32], Error> {
    Ok(generate_shared_key(secret_key, public_key)?)
}

/// Promote a raw 32-byte key to nostr keys for NIP-44 encryption to self.
fn symmetric_keys(key: &[u8; 32]) -> Result<Keys, Error> {
    let secret_key = SecretKey::from_slice(key)?;
    Ok(Keys::new(secret_key))
}

/// Encrypt under a raw 32-byte key with versioned conversation-key encryption.
pub(crate) fn encrypt_with_key(key: &[u8; 32], plaintext: &[u8]) -> Result<String, Error> {
    let keys = symmetric_keys(key)?;
    Ok(nip44::encrypt(
        keys.secret_key(),
        &keys.public_key,
        plaintext,
        Version::default(),
    )?)
}

/// Decrypt a payload produced by [`encrypt_with_key`].
pub(crate) fn decrypt_with_key(key: &[u8; 32], payload: &str) -> Result<Vec<u8>, Error> {
    let keys = symmetric_keys(key)?;
    Ok(nip44::decrypt_to_bytes(
        keys.secret_key(),
        &keys.public_key,
        payload,
    )?)
}

/// Generate a random 32-byte shared secret.
pub(crate) fn random_secret() -> [u8; 32] {
    SecretKey::generate().to_secret_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_outputs_are_distinct() {
        let (root, chain, header) = root_step(&[1u8; 32], &[2u8; 32]);
        assert_ne!(root, chain);
        assert_ne!(chain, header);
        assert_ne!(root, header);
    }

    #[test]
    fn test_kdf_is_deterministic() {
        assert_eq!(root_step(&[7u8; 32], &[9u8; 32]), root_step(&[7u8; 32], &[9u8; 32]));
        assert_eq!(chain_step(&[3u8; 32]), chain_step(&[3u8; 32]));
        assert_ne!(chain_step(&[3u8; 32]), chain_step(&[4u8; 32]));
    }

    #[test]
    fn test_conversation_key_is_shared() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let ab = conversation_key(alice.secret_key(), &bob.public_key()).unwrap();
        let ba = conversation_key(bob.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_keyed_encryption_roundtrip() {
        let key: [u8; 32] = random_secret();
        let payload = encrypt_with_key(&key, b"but gold").unwrap();
        assert_eq!(decrypt_with_key(&key, &payload).unwrap(), b"but gold");
    }

    #[test]
    fn test_keyed_encryption_wrong_key_fails() {
        let payload = encrypt_with_key(&random_secret(), b"nothing to see").unwrap();
        assert!(decrypt_with_key(&random_secret(), &payload).is_err());
    }
}
