//! Low-level cryptographic operations.
//!
//! This module is the only place in the crate that touches `ring::aead`.
//! Every wrap, unwrap, encrypt and decrypt in the key hierarchy goes
//! through [`seal`] and [`open`].
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per seal via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//!
//! Unlike a self-framing layout, the nonce is returned separately from the
//! ciphertext: the envelope schema carries it as its own field.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::VaultError;

/// The AEAD algorithm used throughout ringvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a KEK or DEK in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Output of a single [`seal`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
}

/// Fill `buf` from the system CSPRNG.
fn fill_random(buf: &mut [u8]) -> Result<(), VaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::RandomnessFailure)
}

fn less_safe_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, VaultError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| VaultError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes` with AES-256-GCM.
///
/// A fresh random nonce is drawn for every call. There is no nonce caching
/// or counter-based generation, so a key never sees the same nonce twice
/// (up to the birthday bound of 96 random bits).
pub fn seal(key_bytes: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Sealed, VaultError> {
    let key = less_safe_key(key_bytes)?;

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
    in_out.extend_from_slice(plaintext);
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed)?;

    Ok(Sealed {
        nonce,
        ciphertext: in_out,
    })
}

/// Decrypt a ciphertext produced by [`seal`].
///
/// If the key, nonce or ciphertext is wrong the GCM check fails and the
/// caller receives `DecryptionFailed` and never partial plaintext. A nonce of
/// the wrong length is treated the same way.
pub fn open(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, VaultError> {
    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| VaultError::DecryptionFailed)?;
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::DecryptionFailed);
    }

    let key = less_safe_key(key_bytes)?;
    let mut payload = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut payload)
        .map_err(|_| VaultError::DecryptionFailed)?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random 256-bit key.
///
/// This is the only function in the crate that produces raw key material
/// from scratch.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], VaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}
