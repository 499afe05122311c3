//! The vault service: the public operation surface.
//!
//! ```text
//! caller ─> Vault ─┬─ cache hit ──────────────────────────┐
//!                  └─ miss ─> Keyring ─> store ─> unwrap ─┴─> AEAD ─> envelope
//! ```
//!
//! `Vault` is cheap to clone and safe to call from any number of concurrent
//! tasks. The DEK cache is shared by all of them; the KEK set is immutable.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditLog, AuditOperation, AuditRecord, AuditSink};
use crate::cache::{dek_cache_key, CacheConfig, CacheHit, DekCache};
use crate::config::VaultConfig;
use crate::envelope::Encrypted;
use crate::error::{ErrorKind, VaultError};
use crate::keyring::{object_key, validate_ring_id, Keyring, RollSummary, LATEST};
use crate::keys::{DataEncryptionKey, KekSet};
use crate::storage::ObjectStore;

/// Result of an encryption: the transport-encoded envelope and the DEK
/// that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptResponse {
    /// Base64 of the serialized [`Encrypted`] envelope.
    pub encrypted: String,
    pub key_id: String,
}

struct VaultInner {
    keyring: Keyring,
    cache: DekCache,
    audit: AuditLog,
}

/// Envelope-encryption service over a set of keyrings.
#[derive(Clone)]
pub struct Vault {
    inner: Arc<VaultInner>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("active_kek", &self.inner.keyring.keks().active_id())
            .field("cached_keys", &self.inner.cache.len())
            .finish()
    }
}

impl Vault {
    pub fn new(keks: KekSet, store: Arc<dyn ObjectStore>, cache: CacheConfig) -> Self {
        Self::from_keyring(Keyring::new(Arc::new(keks), store), cache)
    }

    /// Build a vault from a validated configuration.
    pub fn from_config(config: &VaultConfig, store: Arc<dyn ObjectStore>) -> Result<Self, VaultError> {
        let keks = config.kek_set()?;
        let keyring =
            Keyring::new(Arc::new(keks), store).with_storage_timeout(config.storage_timeout);
        Ok(Self::from_keyring(keyring, config.cache))
    }

    fn from_keyring(keyring: Keyring, cache: CacheConfig) -> Self {
        Self {
            inner: Arc::new(VaultInner {
                keyring,
                cache: DekCache::new(cache),
                audit: AuditLog::new(),
            }),
        }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.inner.keyring
    }

    pub fn cache(&self) -> &DekCache {
        &self.inner.cache
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Forward every audit record to `sink` as well as the in-memory log.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.inner.audit.add_forward_sink(sink);
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create a new DEK for the ring and make it the ring's latest.
    /// Only the id is returned; key material never leaves the vault.
    #[instrument(skip(self))]
    pub async fn create_dek(&self, ring_id: &str) -> Result<String, VaultError> {
        let dek = self
            .create_key(ring_id)
            .await
            .map_err(|e| e.context("create_dek", ring_id))?;
        Ok(dek.id().to_string())
    }

    /// Encrypt `plaintext` under the ring's latest DEK, creating the ring's
    /// first DEK if needed.
    #[instrument(skip(self, plaintext), fields(len = plaintext.len()))]
    pub async fn encrypt(&self, ring_id: &str, plaintext: &[u8]) -> Result<EncryptResponse, VaultError> {
        self.encrypt_inner(ring_id, plaintext)
            .await
            .map_err(|e| e.context("encrypt", ring_id))
    }

    /// Encrypt each item in order. The first failure aborts the batch and
    /// reports the failing index.
    #[instrument(skip(self, plaintexts), fields(items = plaintexts.len()))]
    pub async fn encrypt_bulk<P: AsRef<[u8]> + Sync>(
        &self,
        ring_id: &str,
        plaintexts: &[P],
    ) -> Result<Vec<EncryptResponse>, VaultError> {
        let mut responses = Vec::with_capacity(plaintexts.len());
        for (index, plaintext) in plaintexts.iter().enumerate() {
            let response = self
                .encrypt_inner(ring_id, plaintext.as_ref())
                .await
                .map_err(|e| {
                    VaultError::BulkItem {
                        index,
                        source: Box::new(e),
                    }
                    .context("encrypt_bulk", ring_id)
                })?;
            responses.push(response);
        }
        Ok(responses)
    }

    /// Decrypt a transport-encoded envelope produced by this ring.
    #[instrument(skip(self, encrypted))]
    pub async fn decrypt(&self, ring_id: &str, encrypted: &str) -> Result<Vec<u8>, VaultError> {
        self.decrypt_inner(ring_id, encrypted)
            .await
            .map(|(plaintext, _)| plaintext.to_vec())
            .map_err(|e| e.context("decrypt", ring_id))
    }

    /// Decrypt and re-encrypt under whatever is now the ring's latest DEK.
    #[instrument(skip(self, encrypted))]
    pub async fn reencrypt(&self, ring_id: &str, encrypted: &str) -> Result<EncryptResponse, VaultError> {
        self.reencrypt_inner(ring_id, encrypted)
            .await
            .map_err(|e| e.context("reencrypt", ring_id))
    }

    /// Rewrap every DEK in every ring that is not wrapped by the active KEK.
    ///
    /// Idempotent and resumable: already-current records are skipped, and a
    /// failure leaves previously rolled records in their new state.
    #[instrument(skip(self))]
    pub async fn roll_deks(&self) -> Result<RollSummary, VaultError> {
        let keyring = &self.inner.keyring;
        let mut summary = RollSummary::default();

        for ring_id in keyring.list_rings().await? {
            let rolled = keyring
                .roll_keys(&ring_id)
                .await
                .map_err(|e| e.context("roll_deks", &ring_id))?;
            // The alias and its dated record hold the same DEK: one record per DEK.
            let dek_ids: BTreeSet<&str> =
                rolled.rewrapped.iter().map(|r| r.dek_id.as_str()).collect();
            for dek_id in dek_ids {
                self.inner
                    .audit
                    .append(AuditRecord::new(AuditOperation::DekRewrapped, &ring_id, dek_id));
            }
            summary.merge(rolled);
        }

        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn encrypt_inner(&self, ring_id: &str, plaintext: &[u8]) -> Result<EncryptResponse, VaultError> {
        validate_ring_id(ring_id)?;
        let dek = self.latest_key(ring_id).await?;
        let encrypted = Encrypted::seal(dek.as_bytes(), dek.id(), plaintext)?;
        Ok(EncryptResponse {
            encrypted: encrypted.to_base64()?,
            key_id: dek.id().to_string(),
        })
    }

    async fn decrypt_inner(
        &self,
        ring_id: &str,
        encrypted: &str,
    ) -> Result<(Zeroizing<Vec<u8>>, Encrypted), VaultError> {
        validate_ring_id(ring_id)?;
        let envelope = Encrypted::from_base64(encrypted)?;
        let dek_id = envelope.encryption_key_id.as_str();
        if dek_id.is_empty() || dek_id.contains('/') || dek_id == LATEST {
            return Err(VaultError::InvalidEnvelope(format!("bad key id {dek_id:?}")));
        }

        let dek = self.key_by_id(ring_id, dek_id).await?;
        let plaintext = Zeroizing::new(envelope.open(dek.as_bytes())?);
        Ok((plaintext, envelope))
    }

    async fn reencrypt_inner(&self, ring_id: &str, encrypted: &str) -> Result<EncryptResponse, VaultError> {
        let (plaintext, envelope) = self.decrypt_inner(ring_id, encrypted).await?;

        let cache = &self.inner.cache;
        cache.remove(&dek_cache_key(ring_id, LATEST));
        cache.remove(&dek_cache_key(ring_id, &envelope.encryption_key_id));

        let response = self.encrypt_inner(ring_id, &plaintext).await?;
        self.inner.audit.append(
            AuditRecord::new(AuditOperation::ReEncrypted, ring_id, &response.key_id)
                .with_previous_key(envelope.encryption_key_id),
        );
        Ok(response)
    }

    async fn create_key(&self, ring_id: &str) -> Result<Arc<DataEncryptionKey>, VaultError> {
        let dek = Arc::new(self.inner.keyring.create_key(ring_id).await?);
        self.inner.cache_latest(ring_id, &dek);
        self.inner
            .audit
            .append(AuditRecord::new(AuditOperation::DekCreated, ring_id, dek.id()));
        Ok(dek)
    }

    /// The ring's latest DEK: cache first, then storage, then lazy creation.
    async fn latest_key(&self, ring_id: &str) -> Result<Arc<DataEncryptionKey>, VaultError> {
        let lookup = self.inner.cache.get(&dek_cache_key(ring_id, LATEST));
        if let Some(dek) = lookup.value {
            debug!(dek_id = %dek.id(), "latest key cache hit");
            if lookup.revalidate {
                self.spawn_revalidate(ring_id, LATEST);
            }
            return Ok(dek);
        }

        match self.inner.keyring.get_key(ring_id, LATEST).await {
            Ok(dek) => {
                let dek = Arc::new(dek);
                self.inner.cache_latest(ring_id, &dek);
                Ok(dek)
            }
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => {
                warn!(ring_id, "keyring has no key yet, creating one");
                self.create_key(ring_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// A specific DEK by id. Absent ids are cached as null.
    async fn key_by_id(&self, ring_id: &str, dek_id: &str) -> Result<Arc<DataEncryptionKey>, VaultError> {
        let cache_key = dek_cache_key(ring_id, dek_id);
        let lookup = self.inner.cache.get(&cache_key);
        match (lookup.hit, lookup.value) {
            (CacheHit::Hit, Some(dek)) => {
                debug!(dek_id, "key cache hit");
                if lookup.revalidate {
                    self.spawn_revalidate(ring_id, dek_id);
                }
                return Ok(dek);
            }
            (CacheHit::Null, _) => {
                debug!(dek_id, "key cached as absent");
                return Err(VaultError::ObjectNotFound {
                    key: object_key(ring_id, dek_id),
                });
            }
            _ => {}
        }

        match self.inner.keyring.get_key(ring_id, dek_id).await {
            Ok(dek) => {
                let dek = Arc::new(dek);
                self.inner.cache.set(cache_key, Arc::clone(&dek));
                Ok(dek)
            }
            Err(e) => {
                if e.kind() == ErrorKind::ObjectNotFound {
                    self.inner.cache.set_null(cache_key);
                }
                Err(e)
            }
        }
    }

    /// Refresh a cache entry in the background. Without a runtime the entry
    /// simply ages out at its stale bound.
    fn spawn_revalidate(&self, ring_id: &str, key_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let ring_id = ring_id.to_string();
        let key_id = key_id.to_string();

        handle.spawn(async move {
            let cache_key = dek_cache_key(&ring_id, &key_id);
            match inner.keyring.get_key(&ring_id, &key_id).await {
                Ok(dek) => {
                    let dek = Arc::new(dek);
                    if key_id == LATEST {
                        inner.cache_latest(&ring_id, &dek);
                    } else {
                        inner.cache.set(cache_key, dek);
                    }
                }
                Err(e) if e.kind() == ErrorKind::ObjectNotFound => {
                    inner.cache.remove(&cache_key);
                }
                Err(e) => {
                    warn!(ring_id = %ring_id, key_id = %key_id, error = %e, "cache revalidation failed");
                }
            }
        });
    }
}

impl VaultInner {
    fn cache_latest(&self, ring_id: &str, dek: &Arc<DataEncryptionKey>) {
        self.cache
            .set(dek_cache_key(ring_id, LATEST), Arc::clone(dek));
        self.cache
            .set(dek_cache_key(ring_id, dek.id()), Arc::clone(dek));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::keys::KeyEncryptionKey;
    use crate::storage::MemoryObjectStore;

    fn vault_with(store: &Arc<MemoryObjectStore>, cache: CacheConfig) -> Vault {
        let keks = KekSet::new(vec![KeyEncryptionKey::new("kek_1", [9u8; 32])]).unwrap();
        Vault::new(keks, Arc::clone(store) as Arc<dyn ObjectStore>, cache)
    }

    #[tokio::test]
    async fn encrypt_populates_latest_and_id_entries() {
        let store = Arc::new(MemoryObjectStore::new());
        let vault = vault_with(&store, CacheConfig::default());

        let resp = vault.encrypt("t", b"hello").await.unwrap();
        assert_eq!(vault.cache().len(), 2);
        assert_eq!(
            vault.cache().get(&dek_cache_key("t", LATEST)).hit,
            CacheHit::Hit
        );
        assert_eq!(
            vault.cache().get(&dek_cache_key("t", &resp.key_id)).hit,
            CacheHit::Hit
        );
        assert_eq!(vault.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn missing_dek_is_cached_as_null() {
        let store = Arc::new(MemoryObjectStore::new());
        let vault = vault_with(&store, CacheConfig::default());
        let resp = vault.encrypt("a", b"x").await.unwrap();

        // Same envelope presented to another ring: that ring has no such DEK.
        let err = vault.decrypt("b", &resp.encrypted).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
        assert_eq!(
            vault.cache().get(&dek_cache_key("b", &resp.key_id)).hit,
            CacheHit::Null
        );
        let again = vault.decrypt("b", &resp.encrypted).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::ObjectNotFound);
    }

    #[tokio::test]
    async fn reencrypt_invalidates_only_touched_entries() {
        let store = Arc::new(MemoryObjectStore::new());
        let vault = vault_with(&store, CacheConfig::default());
        let a = vault.encrypt("a", b"one").await.unwrap();
        vault.encrypt("b", b"two").await.unwrap();

        vault.reencrypt("a", &a.encrypted).await.unwrap();

        assert_eq!(
            vault.cache().get(&dek_cache_key("b", LATEST)).hit,
            CacheHit::Hit
        );
    }

    #[tokio::test]
    async fn works_with_caching_disabled() {
        let store = Arc::new(MemoryObjectStore::new());
        let vault = vault_with(
            &store,
            CacheConfig {
                max_size: 0,
                ..CacheConfig::default()
            },
        );
        let resp = vault.encrypt("t", b"no cache").await.unwrap();
        assert_eq!(vault.decrypt("t", &resp.encrypted).await.unwrap(), b"no cache");
        assert!(vault.cache().is_empty());
        // Lazily created once, then found in storage.
        assert_eq!(vault.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn stale_latest_entry_is_revalidated_in_background() {
        let store = Arc::new(MemoryObjectStore::new());
        let cache = CacheConfig {
            fresh: Duration::from_millis(1),
            stale: Duration::from_secs(60),
            max_size: 100,
        };
        let writer = vault_with(&store, cache);
        let reader = vault_with(&store, cache);

        let first = reader.encrypt("t", b"x").await.unwrap();
        let rotated = writer.create_dek("t").await.unwrap();
        assert_ne!(first.key_id, rotated);

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Served from cache while the refresh runs.
        let during = reader.encrypt("t", b"x").await.unwrap();
        assert_eq!(during.key_id, first.key_id);

        let mut refreshed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(dek) = reader.cache().get(&dek_cache_key("t", LATEST)).value {
                if dek.id() == rotated {
                    refreshed = true;
                    break;
                }
            }
        }
        assert!(refreshed, "background revalidation did not pick up the new key");
    }

    #[tokio::test]
    async fn envelope_key_ids_cannot_address_aliases() {
        let store = Arc::new(MemoryObjectStore::new());
        let vault = vault_with(&store, CacheConfig::default());
        let resp = vault.encrypt("t", b"x").await.unwrap();

        for forged in [LATEST, "", "other/dek_1"] {
            let mut env = Encrypted::from_base64(&resp.encrypted).unwrap();
            env.encryption_key_id = forged.to_string();
            let err = vault
                .decrypt("t", &env.to_base64().unwrap())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidEnvelope, "{forged:?}");
        }
    }
}
