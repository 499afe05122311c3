//! In-memory object store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ObjectStore, StorageResult};

/// A process-local object store backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn list_object_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
