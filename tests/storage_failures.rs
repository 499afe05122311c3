//! Behaviour when the object store is slow, down or fails part-way.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ringvault::storage::StorageResult;
use ringvault::{
    generate_master_key, CacheConfig, ErrorKind, MemoryObjectStore, ObjectStore, StorageError,
    Vault, VaultConfig, VaultError,
};

/// Delegates to a memory store, failing calls once a budget is spent.
struct FaultyStore {
    inner: MemoryObjectStore,
    puts_left: AtomicUsize,
    gets_left: AtomicUsize,
}

impl FaultyStore {
    fn new(puts: usize, gets: usize) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            puts_left: AtomicUsize::new(puts),
            gets_left: AtomicUsize::new(gets),
        }
    }

    fn take(budget: &AtomicUsize) -> StorageResult<()> {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| StorageError::Unavailable("injected failure".into()))
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_object(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        Self::take(&self.puts_left)?;
        self.inner.put_object(key, data).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Self::take(&self.gets_left)?;
        self.inner.get_object(key).await
    }

    async fn list_object_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list_object_keys(prefix).await
    }
}

/// Delegates to a memory store after a fixed delay.
struct SlowStore {
    inner: MemoryObjectStore,
    delay: Duration,
}

#[async_trait]
impl ObjectStore for SlowStore {
    async fn put_object(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_object(key, data).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_object(key).await
    }

    async fn list_object_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_object_keys(prefix).await
    }
}

fn master_keys() -> Vec<String> {
    vec![generate_master_key("kek_1").unwrap().encode().unwrap()]
}

fn uncached() -> CacheConfig {
    CacheConfig {
        max_size: 0,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn test_storage_deadline_is_enforced() {
    let store = Arc::new(SlowStore {
        inner: MemoryObjectStore::new(),
        delay: Duration::from_millis(500),
    });
    let config = VaultConfig::new(master_keys()).with_storage_timeout(Duration::from_millis(20));
    let vault = Vault::from_config(&config, store).unwrap();

    let err = vault.encrypt("tenant_1", b"x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unavailable_store_is_retryable() {
    let store = Arc::new(FaultyStore::new(0, 0));
    let config = VaultConfig::new(master_keys());
    let vault = Vault::from_config(&config, store).unwrap();

    let err = vault.create_dek("tenant_1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("create_dek"));
}

#[tokio::test]
async fn test_partial_create_leaves_dated_record_reachable() {
    // The dated put succeeds, the LATEST put fails.
    let store = Arc::new(FaultyStore::new(1, usize::MAX));
    let config = VaultConfig::new(master_keys()).with_cache(uncached());
    let vault = Vault::from_config(&config, Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let err = vault.create_dek("tenant_1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

    let keys = store.list_object_keys("keyring/tenant_1/").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(!keys[0].ends_with("/LATEST"));

    let dek_id = keys[0].rsplit('/').next().unwrap();
    let dek = vault.keyring().get_key("tenant_1", dek_id).await.unwrap();
    assert_eq!(dek.id(), dek_id);
}

#[tokio::test]
async fn test_bulk_failure_reports_index() {
    let store = Arc::new(FaultyStore::new(usize::MAX, 2));
    let config = VaultConfig::new(master_keys()).with_cache(uncached());
    let vault = Vault::from_config(&config, store).unwrap();
    vault.create_dek("tenant_1").await.unwrap();

    // Without a cache each item reads LATEST once; the third read fails.
    let items = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()];
    let err = vault.encrypt_bulk("tenant_1", &items).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

    let VaultError::Context { operation, source, .. } = err else {
        panic!("expected context wrapper");
    };
    assert_eq!(operation, "encrypt_bulk");
    assert!(matches!(*source, VaultError::BulkItem { index: 2, .. }));
}

#[tokio::test]
async fn test_cached_key_serves_through_outage() {
    let store = Arc::new(FaultyStore::new(usize::MAX, 1));
    let config = VaultConfig::new(master_keys());
    let vault = Vault::from_config(&config, store).unwrap();

    // The first encrypt spends the only read on the empty LATEST lookup.
    let resp = vault.encrypt("tenant_1", b"x").await.unwrap();

    // Every further storage read would fail; the cache absorbs them.
    for _ in 0..10 {
        vault.encrypt("tenant_1", b"y").await.unwrap();
    }
    assert_eq!(vault.decrypt("tenant_1", &resp.encrypted).await.unwrap(), b"x");
}
