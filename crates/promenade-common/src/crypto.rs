//! Encrypted direct payloads between two keys (shard deliveries and
//! NIP-46 envelopes).
//!
//! The conversation key is `sha256(x(ECDH(sk, pk)))`; payloads are
//! ChaCha20-Poly1305 sealed with a random 12-byte nonce and carried as
//! `hex(nonce || ciphertext)`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CommonError;
use crate::event::Keys;
use crate::Result;

fn conversation_key(keys: &Keys, their_pubkey_hex: &str) -> Result<[u8; 32]> {
    let shared = keys.shared_secret(their_pubkey_hex)?;
    Ok(Sha256::digest(shared).into())
}

/// Seal `plaintext` so only the holder of `their_pubkey`'s secret (or
/// ours) can open it.
pub fn encrypt(keys: &Keys, their_pubkey_hex: &str, plaintext: &str) -> Result<String> {
    let key = conversation_key(keys, their_pubkey_hex)?;
    let cipher = ChaCha20Poly1305::new((&key).into());

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CommonError::Encrypt)?;

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Open a payload produced by [`encrypt`] on the other side.
pub fn decrypt(keys: &Keys, their_pubkey_hex: &str, content: &str) -> Result<String> {
    let bytes = hex::decode(content)?;
    if bytes.len() < 12 + 16 {
        return Err(CommonError::Decrypt);
    }

    let key = conversation_key(keys, their_pubkey_hex)?;
    let cipher = ChaCha20Poly1305::new((&key).into());
    let nonce = Nonce::from_slice(&bytes[..12]);

    let plaintext = cipher
        .decrypt(nonce, &bytes[12..])
        .map_err(|_| CommonError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CommonError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_between_two_parties() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let sealed = encrypt(&alice, &bob.public_key(), "the shard").unwrap();
        let opened = decrypt(&bob, &alice.public_key(), &sealed).unwrap();
        assert_eq!(opened, "the shard");
    }

    #[test]
    fn third_party_cannot_open() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let sealed = encrypt(&alice, &bob.public_key(), "secret").unwrap();
        assert!(decrypt(&eve, &alice.public_key(), &sealed).is_err());
    }

    #[test]
    fn corrupted_payload_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let sealed = encrypt(&alice, &bob.public_key(), "secret").unwrap();
        let mut corrupted = hex::decode(&sealed).unwrap();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        assert!(decrypt(&bob, &alice.public_key(), &hex::encode(corrupted)).is_err());
    }
}
