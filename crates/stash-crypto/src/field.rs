//! Per-field XChaCha20-Poly1305 envelopes
//!
//! Envelope format (before base64):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The whole envelope is base64-encoded (standard alphabet) so it travels as
//! an ordinary string field. The empty string is the identity in both
//! directions: absent fields are stored and transmitted as empty, never
//! encrypted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::kdf::StorageKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt one plaintext field value under the session storage key.
///
/// Empty input bypasses encryption and returns the empty string.
pub fn encrypt_field(key: &StorageKey, plaintext: &str) -> anyhow::Result<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    seal(key, plaintext.as_bytes())
}

/// Decrypt one field envelope back to plaintext.
///
/// Fails closed: a decode error, truncated envelope, or authentication-tag
/// mismatch is an error, never silently wrong plaintext.
pub fn decrypt_field(key: &StorageKey, envelope: &str) -> anyhow::Result<String> {
    if envelope.is_empty() {
        return Ok(String::new());
    }
    let plaintext = open(key, envelope)?;
    String::from_utf8(plaintext).map_err(|_| anyhow::anyhow!("decrypted field is not valid UTF-8"))
}

/// Encrypt attachment bytes as a single blob with the same envelope.
pub fn encrypt_blob(key: &StorageKey, plaintext: &[u8]) -> anyhow::Result<String> {
    seal(key, plaintext)
}

/// Decrypt a blob envelope produced by [`encrypt_blob`].
pub fn decrypt_blob(key: &StorageKey, envelope: &str) -> anyhow::Result<Vec<u8>> {
    open(key, envelope)
}

fn seal(key: &StorageKey, plaintext: &[u8]) -> anyhow::Result<String> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("field encryption failed: {e}"))?;

    let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

fn open(key: &StorageKey, envelope: &str) -> anyhow::Result<Vec<u8>> {
    let raw = BASE64
        .decode(envelope)
        .map_err(|e| anyhow::anyhow!("envelope is not valid base64: {e}"))?;

    if raw.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "envelope too short: {} bytes (minimum {})",
            raw.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("field decryption failed: wrong key or corrupted envelope"))
}
