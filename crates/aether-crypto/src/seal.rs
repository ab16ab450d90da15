//! AES-128-GCM payload sealing.
//!
//! The associated data is the complete 30-byte record header, so version,
//! kind, timestamp, lengths, session id, and counter are all covered by
//! the authentication tag: any header tamper fails `open` even though the
//! header itself is plaintext. The `payload_length` header field must be
//! stamped with `plaintext + 16` *before* sealing, since the sealed tag
//! binds the header bytes as sent.

use aes_gcm::{
    Aes128Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{derive::RecordKey, error::CryptoError, nonce::NONCE_SIZE};

/// GCM authentication tag length. Sealed payloads are always
/// `plaintext.len() + TAG_SIZE` bytes.
pub const TAG_SIZE: usize = 16;

/// Seal a plaintext under `key` and `nonce`, authenticating `aad`.
///
/// Returns ciphertext with the 16-byte tag appended.
#[must_use]
pub fn seal(key: &RecordKey, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.bytes()));

    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("AES-GCM encryption cannot fail with valid key and nonce lengths");
    };

    ciphertext
}

/// Open a sealed payload, verifying the tag over ciphertext and `aad`.
///
/// # Errors
///
/// - `CryptoError::OpenFailed` on tag mismatch, a wrong key, a tampered
///   header, or a truncated ciphertext
pub fn open(
    key: &RecordKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::OpenFailed)
}
