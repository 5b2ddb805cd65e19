//! Key material ownership, wrapping, and derivation.
//!
//! This module owns three responsibilities:
//! 1. Holding master and data-encryption key material in types that are
//!    opaque, non-cloneable, and zeroised on drop.
//! 2. Wrapping a data-encryption key (DEK) under the local master key, and
//!    unwrapping it again, the way a local KMS provider does.
//! 3. Deriving the per-purpose AEAD and MAC subkeys from a DEK using
//!    HKDF-SHA256.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `crypto`).
//!
//! ## Derivation structure
//!
//! ```text
//! wrap key  = HKDF-SHA256(ikm = master_key, info = "local-kms:wrap")
//! field enc = HKDF-SHA256(ikm = dek,        info = "field:enc")
//! field mac = HKDF-SHA256(ikm = dek,        info = "field:mac")
//! ```

use ring::hkdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::FleError;

/// Length of a local master key in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// Length of a data-encryption key in bytes.
pub const DATA_KEY_LEN: usize = 96;

mod info {
    pub const WRAP: &str = "local-kms:wrap";
    pub const FIELD_ENC: &str = "field:enc";
    pub const FIELD_MAC: &str = "field:mac";
}

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The local master key used to wrap data-encryption keys.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
/// - `Debug` never prints the bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    ///
    /// Production callers load the key with
    /// [`read_master_key`](crate::key_material::read_master_key).
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a fresh random master key. Intended for tests and local
    /// bootstrapping of a key file.
    pub fn generate() -> Result<Self, FleError> {
        Ok(Self::from_bytes(crypto::generate_random()?))
    }

    /// Borrow the raw bytes. `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

// ---------------------------------------------------------------------------
// Data-encryption key
// ---------------------------------------------------------------------------

/// A data-encryption key in its unwrapped form.
///
/// Exists only inside the auto-encryption layer and during key creation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DataKey {
    bytes: [u8; DATA_KEY_LEN],
}

impl DataKey {
    pub(crate) fn generate() -> Result<Self, FleError> {
        Ok(Self {
            bytes: crypto::generate_random()?,
        })
    }

    /// Wrap the key under `master`. `key_id` is bound in as associated data so
    /// a wrapped blob cannot be transplanted onto another key record.
    pub(crate) fn wrap(&self, master: &MasterKey, key_id: &[u8]) -> Result<Vec<u8>, FleError> {
        let wrap_key = derive(master.as_bytes(), info::WRAP)?;
        crypto::encrypt(wrap_key.as_bytes(), key_id, &self.bytes)
    }

    /// Reverse of [`DataKey::wrap`].
    pub(crate) fn unwrap(master: &MasterKey, key_id: &[u8], wrapped: &[u8]) -> Result<Self, FleError> {
        let wrap_key = derive(master.as_bytes(), info::WRAP)?;
        let mut plain = crypto::decrypt(wrap_key.as_bytes(), key_id, wrapped)?;
        if plain.len() != DATA_KEY_LEN {
            plain.zeroize();
            return Err(FleError::InvalidKey);
        }
        let mut bytes = [0u8; DATA_KEY_LEN];
        bytes.copy_from_slice(&plain);
        plain.zeroize();
        Ok(Self { bytes })
    }

    /// Derive the subkeys used to encrypt field values.
    pub(crate) fn field_keys(&self) -> Result<FieldKeys, FleError> {
        Ok(FieldKeys {
            enc: derive(&self.bytes, info::FIELD_ENC)?,
            mac: derive(&self.bytes, info::FIELD_MAC)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Derived keys
// ---------------------------------------------------------------------------

/// A 256-bit key derived for one purpose. Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// AEAD and MAC subkeys of one data-encryption key.
pub(crate) struct FieldKeys {
    pub(crate) enc: DerivedKey,
    pub(crate) mac: DerivedKey,
}

fn derive(ikm: &[u8], info: &str) -> Result<DerivedKey, FleError> {
    // Empty salt: HKDF treats it as a zero-filled salt of hash length.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(ikm);

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| FleError::KeyDerivationFailure)?;

    let mut derived = [0u8; KEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| FleError::KeyDerivationFailure)?;

    Ok(DerivedKey { bytes: derived })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let master = MasterKey::from_bytes([4u8; MASTER_KEY_LEN]);
        let dek = DataKey::generate().unwrap();
        let wrapped = dek.wrap(&master, b"key-1").unwrap();

        let back = DataKey::unwrap(&master, b"key-1", &wrapped).unwrap();
        assert_eq!(back.bytes, dek.bytes);
    }

    #[test]
    fn unwrap_fails_under_other_master_or_id() {
        let master = MasterKey::from_bytes([4u8; MASTER_KEY_LEN]);
        let other = MasterKey::from_bytes([5u8; MASTER_KEY_LEN]);
        let dek = DataKey::generate().unwrap();
        let wrapped = dek.wrap(&master, b"key-1").unwrap();

        assert!(DataKey::unwrap(&other, b"key-1", &wrapped).is_err());
        assert!(DataKey::unwrap(&master, b"key-2", &wrapped).is_err());
    }

    #[test]
    fn debug_redacts_master_key() {
        let master = MasterKey::from_bytes([0xAB; MASTER_KEY_LEN]);
        assert_eq!(format!("{master:?}"), "MasterKey([redacted])");
    }
}
