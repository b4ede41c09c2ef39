//! stash-crypto: client-side encryption for stash
//!
//! The server is a blind store of ciphertext: every non-empty record field
//! is sealed on the client before it reaches the wire, and attachment bytes
//! are sealed as a single blob with the same envelope.
//!
//! ```text
//! Storage Key (256-bit, Argon2id from login+password, salt = SHA-256(login))
//!   └── Field envelope: XChaCha20-Poly1305, random 192-bit nonce,
//!       base64(nonce || ciphertext || tag)
//! Transfer layer (optional): age X25519, armored, passthrough without keys
//! ```

pub mod field;
pub mod kdf;
pub mod transfer;

pub use field::{decrypt_blob, decrypt_field, encrypt_blob, encrypt_field};
pub use kdf::{derive_storage_key, KdfParams, StorageKey};
pub use transfer::TransferCipher;

/// Size of the storage key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
