//! Key ownership and generation.
//!
//! This module owns three responsibilities:
//! 1. Holding KEK and DEK material in types that redact themselves in
//!    `Debug` output and are zeroised on drop.
//! 2. The read-only set of master keys a process was started with.
//! 3. Producing fresh key material together with sortable unique ids.
//!
//! ## Hierarchy
//!
//! ```text
//! KEK (operator supplied, immutable for the process lifetime)
//!  └── wraps ──> DEK (random, per keyring)
//!                 └── encrypts ──> caller data
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::envelope;
use crate::error::VaultError;

/// Prefix of every data encryption key id.
pub const DEK_PREFIX: &str = "dek";

// ---------------------------------------------------------------------------
// Key generator
// ---------------------------------------------------------------------------

/// Generate a fresh key and an id of the form `{prefix}_{token}`.
///
/// The token is a UUIDv7 in simple (32 hex digit) form. Its leading bits
/// are a millisecond timestamp, so ids sort lexicographically by creation
/// time while remaining collision resistant across processes.
pub fn generate_key(prefix: &str) -> Result<(String, [u8; KEY_LEN]), VaultError> {
    let key = crypto::generate_random_key()?;
    let id = format!("{}_{}", prefix, uuid::Uuid::now_v7().simple());
    Ok((id, key))
}

/// The current time truncated to the millisecond precision of the wire format.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Key encryption key
// ---------------------------------------------------------------------------

/// A master key. KEKs only ever wrap DEKs; they never touch caller data.
///
/// - Not `Clone`. A KEK lives in exactly one [`KekSet`].
/// - Zeroised on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyEncryptionKey {
    #[zeroize(skip)]
    id: String,
    key: [u8; KEY_LEN],
}

impl KeyEncryptionKey {
    /// Construct a KEK from an id and raw bytes.
    pub fn new(id: impl Into<String>, key: [u8; KEY_LEN]) -> Self {
        Self { id: id.into(), key }
    }

    /// Generate a KEK with fresh random key material.
    pub fn generate(id: impl Into<String>) -> Result<Self, VaultError> {
        Ok(Self::new(id, crypto::generate_random_key()?))
    }

    /// Decode a KEK from its base64 configuration form.
    pub fn decode(encoded: &str) -> Result<Self, VaultError> {
        let bytes = zeroize::Zeroizing::new(
            envelope::decode_base64(encoded.trim())
                .map_err(|e| VaultError::Config(format!("master key is not base64: {e}")))?,
        );
        let kek: Self = envelope::decode_message(&bytes)
            .map_err(|e| VaultError::Config(format!("master key is malformed: {e}")))?;
        if kek.id.is_empty() {
            return Err(VaultError::Config("master key has an empty id".into()));
        }
        Ok(kek)
    }

    /// Encode this KEK into the base64 form accepted by the configuration.
    pub fn encode(&self) -> Result<String, VaultError> {
        let bytes = zeroize::Zeroizing::new(envelope::encode_message(self)?);
        Ok(envelope::encode_base64(&bytes))
    }

    /// The KEK id recorded in every envelope it wraps.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Borrow the raw key bytes. Raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEncryptionKey")
            .field("id", &self.id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// KEK set
// ---------------------------------------------------------------------------

/// The master keys a process was configured with.
///
/// Built once at startup and never mutated, so it is shared across all
/// requests without locking. The last key supplied is the active
/// (encrypting) KEK; every key is eligible for decryption.
#[derive(Debug)]
pub struct KekSet {
    active_id: String,
    keys: HashMap<String, KeyEncryptionKey>,
}

impl KekSet {
    /// Build the set from an ordered list. The last key becomes active.
    pub fn new(keys: Vec<KeyEncryptionKey>) -> Result<Self, VaultError> {
        let active_id = keys
            .last()
            .map(|k| k.id().to_string())
            .ok_or_else(|| VaultError::Config("at least one master key is required".into()))?;

        let mut by_id = HashMap::with_capacity(keys.len());
        for kek in keys {
            let id = kek.id().to_string();
            if by_id.insert(id.clone(), kek).is_some() {
                return Err(VaultError::Config(format!("duplicate master key id: {id}")));
            }
        }

        Ok(Self {
            active_id,
            keys: by_id,
        })
    }

    /// Decode an ordered list of base64 master keys.
    pub fn from_encoded<S: AsRef<str>>(encoded: &[S]) -> Result<Self, VaultError> {
        let keys = encoded
            .iter()
            .map(|e| KeyEncryptionKey::decode(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(keys)
    }

    /// The KEK used for every new wrap.
    pub fn active(&self) -> &KeyEncryptionKey {
        // `new` guarantees the active id is present.
        &self.keys[&self.active_id]
    }

    /// Id of the active KEK.
    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    /// Look up a decryption-eligible KEK by id.
    pub fn get(&self, id: &str) -> Option<&KeyEncryptionKey> {
        self.keys.get(id)
    }

    /// Number of decryption-eligible KEKs.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false for a constructed set; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Data encryption key
// ---------------------------------------------------------------------------

/// A data encryption key. Exists in plaintext only in memory and in the
/// DEK cache; at rest it is always wrapped by a KEK.
///
/// Zeroised on drop. Shared through `Arc` once unwrapped, never cloned.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DataEncryptionKey {
    #[zeroize(skip)]
    id: String,
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

impl DataEncryptionKey {
    /// Generate a new DEK with a `dek_` prefixed, time-ordered id.
    pub fn generate() -> Result<Self, VaultError> {
        let (id, key) = generate_key(DEK_PREFIX)?;
        Ok(Self {
            id,
            key,
            created_at: now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Borrow the raw key bytes. Raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
