//! Record key derivation with HKDF-SHA256.
//!
//! `key = HKDF-Expand(HKDF-Extract(salt = session_id, ikm = trim(PSK)),
//! info = "aether-realist-v5", L = 16)`. The salt travels in cleartext in
//! every record header, so the receiver recomputes the same key from its
//! own PSK and the observed session id - no key exchange on the wire.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Derived key length (AES-128).
pub const KEY_SIZE: usize = 16;

/// Domain-separation label for the expand step.
const KDF_INFO: &[u8] = b"aether-realist-v5";

/// A derived AES-128 record key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecordKey([u8; KEY_SIZE]);

impl RecordKey {
    /// Raw key bytes for cipher construction.
    #[must_use]
    pub fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Manual Debug so key bytes never reach logs.
impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordKey(..)")
    }
}

/// Derive the record key for one (PSK, session id) pair.
///
/// Deterministic: both endpoints derive the same key from the same
/// inputs. The PSK is trimmed of surrounding whitespace before use so a
/// trailing newline in a config file cannot split a deployment.
#[must_use]
pub fn derive_record_key(psk: &str, session_id: [u8; 4]) -> RecordKey {
    let hkdf = Hkdf::<Sha256>::new(Some(&session_id), psk.trim().as_bytes());

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(KDF_INFO, &mut key) else {
        unreachable!("16 bytes is a valid HKDF-SHA256 output length");
    };

    RecordKey(key)
}
