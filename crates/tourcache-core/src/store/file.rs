use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{validate_key, PersistentStore, StoreError, StoreResult};

/// `ENOSPC` on Linux/Android and macOS/iOS
const ENOSPC: i32 = 28;

/// One file per key: `<dir>/<namespace>.<key>.json`. Writes go to a
/// uniquely named temporary file first and are renamed into place, so
/// readers never see a partial blob.
pub struct FileStore {
    dir: PathBuf,
    namespace: String,
}

impl FileStore {
    pub fn new(dir: PathBuf, namespace: impl Into<String>) -> StoreResult<Self> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            namespace: namespace.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, key: &str) -> String {
        // ':' is not portable in file names
        format!("{}.{}.json", self.namespace, key.replace(':', "@"))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(self.file_name(key))
    }

    fn io_error(key: &str, source: std::io::Error, needed: usize) -> StoreError {
        if source.raw_os_error() == Some(ENOSPC) {
            StoreError::Full {
                key: key.to_string(),
                needed: needed as u64,
            }
        } else {
            StoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(key, e, 0)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let path = self.path(key);
        // Unique per write so concurrent writers to one key never share it
        let tmp = path.with_extension(format!("json.{:08x}.tmp", rand::random::<u32>()));

        if let Err(e) = tokio::fs::write(&tmp, value).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_error(key, e, value.len()));
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(key, e, value.len()))?;

        debug!(key = key, bytes = value.len(), "Blob written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e, 0)),
        }
    }

    async fn exists(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        match tokio::fs::try_exists(self.path(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(key = key, error = %e, "Failed to check blob existence");
                false
            }
        }
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let prefix = format!("{}.", self.namespace);
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.namespace, e, 0))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.namespace, e, 0))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                keys.push(key.replace('@', ":"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
