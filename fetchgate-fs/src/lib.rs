//! Filesystem durable tier for `fetchgate`.
//!
//! One JSON file per key under `<dir>/<namespace>/`. File names are the hex SHA-256 of the key, so
//! keys of any length map to fixed-size names. Each file also carries the full key; a file whose
//! key differs from the requested one reads as absent. Writes go to a temporary file that is
//! renamed into place, so a reader never sees a half-written record.

use async_trait::async_trait;
use fetchgate::cache::{DurableStore, StoredRecord};
use fetchgate::{CacheConfig, DurableCacheError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "json.tmp";

/// On-disk document: the record plus the key it was stored under.
#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    #[serde(flatten)]
    record: StoredRecord,
}

#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
    unavailable: Option<String>,
}

impl FileStore {
    /// Open (creating if needed) the namespace directory under `dir`.
    ///
    /// Never fails: if the directory cannot be created the store reports `Unavailable` on every
    /// call, which makes a `TieredCache` fall back to its fast tier.
    pub async fn open(dir: impl AsRef<Path>, namespace: &str) -> Self {
        let root = dir.as_ref().join(namespace);
        match tokio::fs::create_dir_all(&root).await {
            Ok(()) => Self { root, unavailable: None },
            Err(err) => {
                tracing::warn!(
                    target: "fetchgate::cache",
                    path = %root.display(),
                    error = %err,
                    "cache directory unusable"
                );
                let reason = format!("{}: {err}", root.display());
                Self { root, unavailable: Some(reason) }
            }
        }
    }

    /// [`open`](Self::open) using the namespace from the cache configuration.
    pub async fn from_config(dir: impl AsRef<Path>, config: &CacheConfig) -> Self {
        Self::open(dir, &config.namespace).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }

    fn check(&self) -> Result<(), DurableCacheError> {
        match &self.unavailable {
            Some(reason) => Err(DurableCacheError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn stem(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{EXTENSION}", Self::stem(key)))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<StoredRecord>, DurableCacheError> {
        self.check()?;
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: FileRecord = serde_json::from_slice(&bytes)?;
        if file.key != key {
            tracing::debug!(target: "fetchgate::cache", key, stored = %file.key, "file name collision; treated as a miss");
            return Ok(None);
        }
        Ok(Some(file.record))
    }

    async fn store(&self, key: &str, record: StoredRecord) -> Result<(), DurableCacheError> {
        self.check()?;
        let path = self.path_for(key);
        let tmp = self.root.join(format!("{}.{TMP_EXTENSION}", Self::stem(key)));
        let bytes = serde_json::to_vec(&FileRecord { key: key.to_string(), record })?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), DurableCacheError> {
        self.check()?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Removes this namespace's records only; other files in the directory are left alone.
    async fn clear(&self) -> Result<(), DurableCacheError> {
        self.check()?;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(&format!(".{EXTENSION}")) || name.ends_with(&format!(".{TMP_EXTENSION}")) {
                match tokio::fs::remove_file(entry.path()).await {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
