//! Master key rotation: add a KEK, roll, retire the old KEK.

use std::sync::Arc;

use ringvault::{
    generate_master_key, AuditOperation, CacheConfig, ErrorKind, KekSet, MemoryObjectStore,
    ObjectStore, Vault, VaultConfig,
};

fn vault(store: &Arc<MemoryObjectStore>, keys: &[&str]) -> Vault {
    let config = VaultConfig::new(keys.iter().map(|k| k.to_string()).collect());
    Vault::from_config(&config, Arc::clone(store) as Arc<dyn ObjectStore>).unwrap()
}

#[tokio::test]
async fn test_rotation_from_k1_to_k2() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();

    // 1. Encrypt under K1 only.
    let v1 = vault(&store, &[&k1]);
    let resp = v1.encrypt("tenant_1", b"survives rotation").await.unwrap();

    // 2. Restart with {K1, K2}: K2 is active, old data still decrypts.
    let v12 = vault(&store, &[&k1, &k2]);
    assert_eq!(v12.keyring().keks().active_id(), "kek_2");
    assert_eq!(
        v12.decrypt("tenant_1", &resp.encrypted).await.unwrap(),
        b"survives rotation"
    );

    // 3. Roll: every record moves to K2.
    let summary = v12.roll_deks().await.unwrap();
    assert_eq!(summary.rewrapped.len(), 2); // dated record + LATEST
    assert_eq!(summary.skipped, 0);

    // 4. Restart with {K2} only.
    let v2 = vault(&store, &[&k2]);
    assert_eq!(
        v2.decrypt("tenant_1", &resp.encrypted).await.unwrap(),
        b"survives rotation"
    );
    let after = v2.encrypt("tenant_1", b"new").await.unwrap();
    assert_eq!(after.key_id, resp.key_id, "rolling keeps DEK ids");
}

#[tokio::test]
async fn test_retired_kek_without_roll_is_unknown() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();

    let resp = vault(&store, &[&k1]).encrypt("tenant_1", b"x").await.unwrap();

    let err = vault(&store, &[&k2])
        .decrypt("tenant_1", &resp.encrypted)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownEncryptionKey);
}

#[tokio::test]
async fn test_roll_is_idempotent() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();

    let v1 = vault(&store, &[&k1]);
    v1.encrypt("a", b"x").await.unwrap();
    v1.create_dek("a").await.unwrap();
    v1.encrypt("b", b"y").await.unwrap();

    let v12 = vault(&store, &[&k1, &k2]);
    let first = v12.roll_deks().await.unwrap();
    assert_eq!(first.rewrapped.len(), 5); // a: 2 dated + LATEST, b: 1 dated + LATEST

    let snapshot: Vec<_> = {
        let mut out = Vec::new();
        for key in store.list_object_keys("keyring/").await.unwrap() {
            out.push(store.get_object(&key).await.unwrap());
        }
        out
    };

    let second = v12.roll_deks().await.unwrap();
    assert!(second.rewrapped.is_empty());
    assert_eq!(second.skipped, 5);

    // A no-op roll performs no writes.
    let mut after = Vec::new();
    for key in store.list_object_keys("keyring/").await.unwrap() {
        after.push(store.get_object(&key).await.unwrap());
    }
    assert_eq!(snapshot, after);
}

#[tokio::test]
async fn test_roll_on_empty_store() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let summary = vault(&store, &[&k1]).roll_deks().await.unwrap();
    assert!(summary.rewrapped.is_empty());
    assert_eq!(summary.skipped, 0);
}

#[tokio::test]
async fn test_roll_is_audited() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();

    let dek_id = vault(&store, &[&k1]).create_dek("tenant_1").await.unwrap();

    let v12 = vault(&store, &[&k1, &k2]);
    v12.roll_deks().await.unwrap();

    // Dated record and LATEST were both rewrapped, but they hold one DEK.
    let records = v12.audit_log().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].operation, AuditOperation::DekRewrapped);
    assert_eq!(records[0].ring_id, "tenant_1");
    assert_eq!(records[0].key_id, dek_id);
}

#[tokio::test]
async fn test_cached_deks_stay_valid_across_roll() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();
    let keks = KekSet::from_encoded(&[&k1, &k2]).unwrap();
    let vault = Vault::new(keks, Arc::clone(&store) as Arc<dyn ObjectStore>, CacheConfig::default());

    seed_ring(&store, &k1).await;
    let resp = vault.encrypt("tenant_1", b"cached").await.unwrap();
    vault.roll_deks().await.unwrap();

    // Rolling changes wrapping, not key material.
    assert_eq!(vault.decrypt("tenant_1", &resp.encrypted).await.unwrap(), b"cached");
}

async fn seed_ring(store: &Arc<MemoryObjectStore>, key: &str) {
    vault(store, &[key]).create_dek("tenant_1").await.unwrap();
}

#[tokio::test]
async fn test_stray_object_does_not_block_roll() {
    let store = Arc::new(MemoryObjectStore::new());
    let k1 = generate_master_key("kek_1").unwrap().encode().unwrap();
    let k2 = generate_master_key("kek_2").unwrap().encode().unwrap();

    let resp = vault(&store, &[&k1]).encrypt("tenant_1", b"x").await.unwrap();
    store.put_object("keyring//stray", vec![1, 2, 3]).await.unwrap();

    let summary = vault(&store, &[&k1, &k2]).roll_deks().await.unwrap();
    assert_eq!(summary.rewrapped.len(), 2);

    let v2 = vault(&store, &[&k2]);
    assert_eq!(v2.decrypt("tenant_1", &resp.encrypted).await.unwrap(), b"x");
}
