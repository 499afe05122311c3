//! Wire schema for wrapped keys and encrypted payloads.
//!
//! Four message shapes share one binary codec (`bincode`, fixed options,
//! bounded size):
//!
//! - [`Encrypted`]: authenticated ciphertext plus the id of the key that
//!   opens it. Used both for a DEK wrapped by a KEK and for caller data
//!   wrapped by a DEK.
//! - [`EncryptedDataEncryptionKey`]: the at-rest form of a DEK.
//! - `DataEncryptionKey` and `KeyEncryptionKey` (in [`crate::keys`]): the
//!   plaintext key messages, only ever encoded transiently.
//!
//! Transport responses additionally base64-encode a serialized
//! [`Encrypted`] so it survives JSON and text channels.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN};
use crate::error::VaultError;
use crate::keys;

/// Upper bound on any single encoded message.
pub const MAX_MESSAGE_LEN: u64 = 16 * 1024 * 1024;

/// The authenticated cipher an envelope was sealed with.
///
/// Closed today, but tagged so future algorithms decode as a distinct
/// variant instead of being mistaken for AES-256-GCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Algorithm {
    Aes256Gcm,
}

/// An authenticated ciphertext and the pointer to the key that opens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encrypted {
    pub algorithm: Algorithm,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// KEK id for wrapped DEKs, DEK id for caller data.
    pub encryption_key_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

impl Encrypted {
    /// Seal `plaintext` under `key` and record `key_id` as the unwrap pointer.
    pub(crate) fn seal(
        key: &[u8; KEY_LEN],
        key_id: &str,
        plaintext: &[u8],
    ) -> Result<Self, VaultError> {
        let sealed = crypto::seal(key, plaintext)?;
        Ok(Self {
            algorithm: Algorithm::Aes256Gcm,
            nonce: sealed.nonce.to_vec(),
            ciphertext: sealed.ciphertext,
            encryption_key_id: key_id.to_string(),
            time: keys::now(),
        })
    }

    /// Open the ciphertext with `key`.
    pub(crate) fn open(&self, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, VaultError> {
        match self.algorithm {
            Algorithm::Aes256Gcm => crypto::open(key, &self.nonce, &self.ciphertext),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        encode_message(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        decode_message(bytes)
    }

    /// Serialize and base64-encode for transport.
    pub fn to_base64(&self) -> Result<String, VaultError> {
        Ok(encode_base64(&self.to_bytes()?))
    }

    /// Inverse of [`Encrypted::to_base64`]. Any failure is `InvalidEnvelope`,
    /// since the input came from a caller rather than from storage.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = decode_base64(encoded.trim())
            .map_err(|e| VaultError::InvalidEnvelope(format!("not base64: {e}")))?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            VaultError::Encoding(msg) => VaultError::InvalidEnvelope(msg),
            other => other,
        })
    }
}

/// The at-rest form of a DEK, stored under `keyring/{ringId}/{dekId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDataEncryptionKey {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// The DEK message sealed by a KEK.
    pub encrypted: Encrypted,
}

impl EncryptedDataEncryptionKey {
    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        encode_message(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        decode_message(bytes)
    }

    /// Id of the KEK this record is currently wrapped with.
    pub fn kek_id(&self) -> &str {
        &self.encrypted.encryption_key_id
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_LEN)
}

pub(crate) fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, VaultError> {
    codec()
        .serialize(message)
        .map_err(|e| VaultError::Encoding(e.to_string()))
}

pub(crate) fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, VaultError> {
    codec()
        .deserialize(bytes)
        .map_err(|e| VaultError::Encoding(e.to_string()))
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub(crate) fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}
