//! DEK lifecycle: create, fetch, wrap, unwrap and roll.
//!
//! A keyring is a caller-chosen namespace (`ringId`, typically a tenant).
//! It has no record of its own; it exists only as the storage prefix
//! `keyring/{ringId}/`. Below it:
//!
//! ```text
//! keyring/{ringId}/{dekId}   one record per DEK, wrapped by a KEK
//! keyring/{ringId}/LATEST    copy of the most recently created record
//! ```
//!
//! Creating a DEK writes the dated record and then `LATEST` as two separate
//! puts. If the second put fails the dated record still exists and is
//! reachable by id; a retried create simply produces another DEK.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::envelope::{self, Encrypted, EncryptedDataEncryptionKey};
use crate::error::{ErrorKind, VaultError};
use crate::keys::{DataEncryptionKey, KekSet};
use crate::storage::{ObjectStore, StorageError, StorageResult};

/// Root prefix of every keyring record.
pub const KEYRING_PREFIX: &str = "keyring/";

/// Alias of the most recently created DEK in a ring.
pub const LATEST: &str = "LATEST";

/// Storage prefix of one ring, including the trailing `/`.
pub fn ring_prefix(ring_id: &str) -> String {
    format!("{KEYRING_PREFIX}{ring_id}/")
}

/// Storage key of one DEK record (or of the `LATEST` alias).
pub fn object_key(ring_id: &str, key_id: &str) -> String {
    format!("{KEYRING_PREFIX}{ring_id}/{key_id}")
}

/// Ring ids must be non-empty and must not contain `/`, so that ring
/// prefixes never overlap.
pub fn validate_ring_id(ring_id: &str) -> Result<(), VaultError> {
    if ring_id.is_empty() || ring_id.contains('/') {
        return Err(VaultError::InvalidRingId(ring_id.to_string()));
    }
    Ok(())
}

/// One record rewritten by a roll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolledRecord {
    pub object_key: String,
    /// The DEK the record holds. For `LATEST` this is the aliased DEK.
    pub dek_id: String,
}

/// Outcome of a roll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollSummary {
    /// Records rewrapped under the active KEK.
    pub rewrapped: Vec<RolledRecord>,
    /// Records already wrapped by the active KEK.
    pub skipped: usize,
}

impl RollSummary {
    pub(crate) fn merge(&mut self, other: RollSummary) {
        self.rewrapped.extend(other.rewrapped);
        self.skipped += other.skipped;
    }
}

/// Owns the KEK set and every DEK operation against the object store.
pub struct Keyring {
    keks: Arc<KekSet>,
    store: Arc<dyn ObjectStore>,
    storage_timeout: Option<Duration>,
}

impl Keyring {
    pub fn new(keks: Arc<KekSet>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            keks,
            store,
            storage_timeout: None,
        }
    }

    /// Bound every object-store call by `timeout`.
    pub fn with_storage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn keks(&self) -> &KekSet {
        &self.keks
    }

    // -----------------------------------------------------------------------
    // Storage access
    // -----------------------------------------------------------------------

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = StorageResult<T>>,
    ) -> Result<T, VaultError> {
        let result = match self.storage_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StorageError::DeadlineExceeded(limit))?,
            None => call.await,
        };
        Ok(result?)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), VaultError> {
        self.with_deadline(self.store.put_object(key, data)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        self.with_deadline(self.store.get_object(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, VaultError> {
        self.with_deadline(self.store.list_object_keys(prefix)).await
    }

    // -----------------------------------------------------------------------
    // Wrap / unwrap
    // -----------------------------------------------------------------------

    /// Serialize `dek`, seal it with the active KEK and serialize the
    /// resulting record.
    pub fn encrypt_and_encode_key(&self, dek: &DataEncryptionKey) -> Result<Vec<u8>, VaultError> {
        let kek = self.keks.active();
        let plaintext = Zeroizing::new(envelope::encode_message(dek)?);
        let encrypted = Encrypted::seal(kek.as_bytes(), kek.id(), &plaintext)?;

        EncryptedDataEncryptionKey {
            id: dek.id().to_string(),
            created_at: dek.created_at(),
            encrypted,
        }
        .to_bytes()
    }

    /// Inverse of [`Keyring::encrypt_and_encode_key`]. Also returns the id of
    /// the KEK that actually wrapped the record, so callers can detect
    /// records that still need rolling.
    pub fn decode_and_decrypt_key(
        &self,
        bytes: &[u8],
    ) -> Result<(DataEncryptionKey, String), VaultError> {
        let record = EncryptedDataEncryptionKey::from_bytes(bytes)?;
        let kek_id = record.kek_id().to_string();
        let kek = self
            .keks
            .get(&kek_id)
            .ok_or_else(|| VaultError::UnknownEncryptionKey {
                key_id: kek_id.clone(),
            })?;

        let plaintext = Zeroizing::new(record.encrypted.open(kek.as_bytes())?);
        let dek: DataEncryptionKey = envelope::decode_message(&plaintext)?;
        if dek.id() != record.id {
            return Err(VaultError::Encoding(format!(
                "record {} holds key {}",
                record.id,
                dek.id()
            )));
        }

        Ok((dek, kek_id))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Generate a DEK for `ring_id` and publish it as both its dated record
    /// and `LATEST`.
    #[instrument(skip(self))]
    pub async fn create_key(&self, ring_id: &str) -> Result<DataEncryptionKey, VaultError> {
        validate_ring_id(ring_id)?;

        let dek = DataEncryptionKey::generate()?;
        let record = self.encrypt_and_encode_key(&dek)?;

        self.put(&object_key(ring_id, dek.id()), record.clone())
            .await?;
        self.put(&object_key(ring_id, LATEST), record).await?;

        info!(dek_id = %dek.id(), kek_id = %self.keks.active_id(), "created data encryption key");
        Ok(dek)
    }

    /// Fetch and unwrap the record `key_id` (a DEK id or `LATEST`).
    #[instrument(skip(self))]
    pub async fn get_key(
        &self,
        ring_id: &str,
        key_id: &str,
    ) -> Result<DataEncryptionKey, VaultError> {
        validate_ring_id(ring_id)?;

        let key = object_key(ring_id, key_id);
        let bytes = self
            .get(&key)
            .await?
            .ok_or_else(|| VaultError::ObjectNotFound { key: key.clone() })?;

        let (dek, kek_id) = self.decode_and_decrypt_key(&bytes)?;
        if key_id != LATEST && dek.id() != key_id {
            return Err(VaultError::Encoding(format!("{key} holds key {}", dek.id())));
        }
        debug!(dek_id = %dek.id(), kek_id = %kek_id, "unwrapped data encryption key");
        Ok(dek)
    }

    /// The ring's newest DEK, creating the first one if the ring is empty.
    pub async fn get_latest_key(&self, ring_id: &str) -> Result<DataEncryptionKey, VaultError> {
        self.get_or_create_key(ring_id, LATEST).await
    }

    /// Like [`Keyring::get_key`], but a missing record is absorbed by
    /// creating a new DEK for the ring.
    pub async fn get_or_create_key(
        &self,
        ring_id: &str,
        key_id: &str,
    ) -> Result<DataEncryptionKey, VaultError> {
        match self.get_key(ring_id, key_id).await {
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => {
                warn!(ring_id, key_id, "key not found, initialising keyring");
                self.create_key(ring_id).await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Rolling
    // -----------------------------------------------------------------------

    /// Rewrap every record in the ring that is not wrapped by the active KEK.
    ///
    /// The DEK id and key material never change, only the wrapping. Stops at
    /// the first failing record; records rolled before it stay rolled, so
    /// the operation is resumable by running it again.
    #[instrument(skip(self))]
    pub async fn roll_keys(&self, ring_id: &str) -> Result<RollSummary, VaultError> {
        validate_ring_id(ring_id)?;

        let mut summary = RollSummary::default();
        for key in self.list(&ring_prefix(ring_id)).await? {
            match self.roll_object(&key).await? {
                Some(dek_id) => summary.rewrapped.push(RolledRecord {
                    object_key: key,
                    dek_id,
                }),
                None => summary.skipped += 1,
            }
        }

        info!(
            rewrapped = summary.rewrapped.len(),
            skipped = summary.skipped,
            "rolled keyring"
        );
        Ok(summary)
    }

    /// Rewrap a single record in place and return the DEK id it holds.
    /// Returns `None` if it was already current or disappeared between
    /// listing and reading.
    ///
    /// `LATEST` is re-read before the write: a create that published a newer
    /// alias in the meantime wins, and the newer record is already wrapped by
    /// the active KEK.
    async fn roll_object(&self, key: &str) -> Result<Option<String>, VaultError> {
        let Some(bytes) = self.get(key).await? else {
            debug!(key, "record vanished during roll");
            return Ok(None);
        };

        let (dek, kek_id) = self.decode_and_decrypt_key(&bytes)?;
        if kek_id == self.keks.active_id() {
            debug!(key, "record already wrapped by active key");
            return Ok(None);
        }

        let rewrapped = self.encrypt_and_encode_key(&dek)?;
        if key.rsplit('/').next() == Some(LATEST) {
            let current = self.get(key).await?;
            if current.as_deref() != Some(bytes.as_slice()) {
                debug!(key, dek_id = %dek.id(), "alias replaced during roll, leaving it");
                return Ok(None);
            }
        }

        self.put(key, rewrapped).await?;
        debug!(key, from = %kek_id, to = %self.keks.active_id(), "rewrapped record");
        Ok(Some(dek.id().to_string()))
    }

    /// Every ring id that currently has at least one record. Keys whose
    /// ring segment is not a valid ring id are logged and skipped.
    pub async fn list_rings(&self) -> Result<Vec<String>, VaultError> {
        let mut rings = BTreeSet::new();
        for key in self.list(KEYRING_PREFIX).await? {
            let Some((ring_id, _)) = key
                .strip_prefix(KEYRING_PREFIX)
                .and_then(|rest| rest.split_once('/'))
            else {
                continue;
            };
            if validate_ring_id(ring_id).is_err() {
                warn!(key = %key, "ignoring object outside any valid ring");
                continue;
            }
            rings.insert(ring_id.to_string());
        }
        Ok(rings.into_iter().collect())
    }
}
