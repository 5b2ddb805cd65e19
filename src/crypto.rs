//! Low-level cryptographic operations.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). All other modules encrypt and decrypt
//! exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Random nonce**: 96-bit, generated fresh per operation via `SystemRandom`
//! - **Deterministic nonce**: first 96 bits of HMAC-SHA256(mac_key, aad || plaintext)
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::FleError;

/// The AEAD algorithm used throughout fieldvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of an AEAD or MAC key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// A nonce for a single encryption operation. Consumed on use.
struct OwnedNonce([u8; NONCE_LEN]);

fn random_nonce() -> Result<OwnedNonce, FleError> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(OwnedNonce(buf))
}

/// Synthetic nonce: equal inputs under the same key give equal nonces, so
/// equal plaintexts produce equal ciphertexts.
fn synthetic_nonce(mac_key: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> OwnedNonce {
    let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(aad);
    ctx.update(plaintext);
    let tag = ctx.sign();
    let mut buf = [0u8; NONCE_LEN];
    buf.copy_from_slice(&tag.as_ref()[..NONCE_LEN]);
    OwnedNonce(buf)
}

fn seal(
    key_bytes: &[u8; KEY_LEN],
    nonce: OwnedNonce,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, FleError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| FleError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(&nonce.0);
    output.extend_from_slice(plaintext);

    // Encrypts `output[NONCE_LEN..]` in place; the GCM tag goes on the end.
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce.0),
            Aad::from(aad),
            &mut output[NONCE_LEN..],
        )
        .map_err(|_| FleError::EncryptionFailure)?;
    output.extend_from_slice(tag.as_ref());

    Ok(output)
}

/// Encrypt with a fresh random nonce.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn encrypt(key_bytes: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, FleError> {
    let nonce = random_nonce()?;
    seal(key_bytes, nonce, aad, plaintext)
}

/// Encrypt with a nonce derived from the plaintext. Same layout as `encrypt`.
///
/// Identical `(keys, aad, plaintext)` always produce identical output, which
/// is what makes the result equality-queryable.
pub fn encrypt_deterministic(
    key_bytes: &[u8; KEY_LEN],
    mac_key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, FleError> {
    let nonce = synthetic_nonce(mac_key, aad, plaintext);
    seal(key_bytes, nonce, aad, plaintext)
}

/// Decrypt output of `encrypt` or `encrypt_deterministic`.
///
/// If the key or AAD is wrong, or the ciphertext has been tampered with, the
/// GCM check fails and no partial plaintext is returned.
pub fn decrypt(key_bytes: &[u8; KEY_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, FleError> {
    if ciphertext.len() < NONCE_LEN + ALGORITHM.tag_len() {
        return Err(FleError::DecryptionFailure);
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| FleError::DecryptionFailure)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| FleError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut payload = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut payload)
        .map_err(|_| FleError::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}

/// Fill `buf` from the system CSPRNG. The only source of randomness in the crate.
pub fn fill_random(buf: &mut [u8]) -> Result<(), FleError> {
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| FleError::RandomnessFailure)
}

/// Generate `N` random bytes.
pub fn generate_random<const N: usize>() -> Result<[u8; N], FleError> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_output_repeats_and_random_does_not() {
        let key = [7u8; KEY_LEN];
        let mac = [9u8; KEY_LEN];

        let a = encrypt_deterministic(&key, &mac, b"ctx", b"A1").unwrap();
        let b = encrypt_deterministic(&key, &mac, b"ctx", b"A1").unwrap();
        assert_eq!(a, b);

        let r1 = encrypt(&key, b"ctx", b"A1").unwrap();
        let r2 = encrypt(&key, b"ctx", b"A1").unwrap();
        assert_ne!(r1, r2);

        assert_eq!(decrypt(&key, b"ctx", &a).unwrap(), b"A1");
        assert_eq!(decrypt(&key, b"ctx", &r1).unwrap(), b"A1");
    }

    #[test]
    fn wrong_aad_is_rejected() {
        let key = [3u8; KEY_LEN];
        let sealed = encrypt(&key, b"field-a", b"secret").unwrap();
        assert!(matches!(
            decrypt(&key, b"field-b", &sealed),
            Err(FleError::DecryptionFailure)
        ));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = [3u8; KEY_LEN];
        assert!(decrypt(&key, b"", &[0u8; NONCE_LEN]).is_err());
    }
}
