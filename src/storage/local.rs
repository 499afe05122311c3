//! Filesystem object store.
//!
//! Each object key maps to a file below the root directory, one directory
//! per `/` segment. Puts write a hidden temporary file and rename it into
//! place, so a crashed or cancelled put never leaves a half-written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{ObjectStore, StorageError, StorageResult};

/// An object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object key to a path, rejecting keys that could escape the root
    /// or collide with temporary files.
    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment.starts_with('.') || segment.contains('\\') {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::now_v7().simple()));

        let mut file = fs::File::create(&tmp).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_object_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let key = format!("{key_prefix}{name}");
                if entry.file_type().await?.is_dir() {
                    let child = format!("{key}/");
                    // Only descend where the prefix can still match.
                    if child.starts_with(prefix) || prefix.starts_with(&child) {
                        pending.push((entry.path(), child));
                    }
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
