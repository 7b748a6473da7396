use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use walkdir::WalkDir;

use super::{RemoteObject, StorageClient, StorageError, StorageLocation, StorageResult};

/// `file` provider: the bucket is a directory under the location's path prefix,
/// typically a mount shared between nodes.
#[derive(Debug, Clone, Default)]
pub struct LocalStorageClient;

impl LocalStorageClient {
    pub fn new() -> Self {
        LocalStorageClient
    }

    fn root(location: &StorageLocation) -> StorageResult<PathBuf> {
        location.local_root().ok_or_else(|| {
            StorageError::Config(format!("{location} is not a filesystem location"))
        })
    }

    /// Resolves a key to a path inside the bucket directory, refusing keys that would
    /// escape it.
    pub fn key_to_path(location: &StorageLocation, key: &str) -> StorageResult<PathBuf> {
        if key.split('/').any(|segment| segment == "..") || key.starts_with('/') {
            return Err(StorageError::Config(format!("invalid storage key '{key}'")));
        }
        Ok(Self::root(location)?.join(key))
    }
}

fn not_found_as_storage_error(error: std::io::Error, key: &str) -> StorageError {
    if error.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else if error.kind() == std::io::ErrorKind::PermissionDenied {
        StorageError::PermissionDenied(key.to_string())
    } else {
        StorageError::Io(error)
    }
}

async fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl StorageClient for LocalStorageClient {
    async fn list(&self, location: &StorageLocation, prefix: &str) -> StorageResult<Vec<RemoteObject>> {
        let root = Self::root(location)?;
        let start = Self::key_to_path(location, prefix)?;
        if !start.exists() {
            return Ok(Vec::new());
        }

        tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            for entry in WalkDir::new(&start) {
                let entry = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = entry
                    .metadata()
                    .map_err(|e| StorageError::Backend(e.to_string()))?
                    .len();
                objects.push(RemoteObject { key, size });
            }
            Ok(objects)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("listing task failed: {e}")))?
    }

    async fn get(&self, location: &StorageLocation, key: &str, destination: &Path) -> StorageResult<u64> {
        let source = Self::key_to_path(location, key)?;
        ensure_parent_dir(destination).await?;
        fs::copy(&source, destination)
            .await
            .map_err(|e| not_found_as_storage_error(e, key))
    }

    async fn put(&self, location: &StorageLocation, key: &str, source: &Path) -> StorageResult<()> {
        let target = Self::key_to_path(location, key)?;
        ensure_parent_dir(&target).await?;
        fs::copy(source, &target).await?;
        Ok(())
    }

    async fn read(&self, location: &StorageLocation, key: &str) -> StorageResult<Vec<u8>> {
        let path = Self::key_to_path(location, key)?;
        fs::read(&path)
            .await
            .map_err(|e| not_found_as_storage_error(e, key))
    }

    async fn write(&self, location: &StorageLocation, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let target = Self::key_to_path(location, key)?;
        ensure_parent_dir(&target).await?;
        fs::write(&target, data).await?;
        Ok(())
    }

    async fn refresh(&self, location: &StorageLocation, key: &str) -> StorageResult<()> {
        let path = Self::key_to_path(location, key)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| not_found_as_storage_error(e, key))?
            .into_std()
            .await;
        tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
            .await
            .map_err(|e| StorageError::Backend(format!("refresh task failed: {e}")))??;
        Ok(())
    }

    async fn exists(&self, location: &StorageLocation) -> StorageResult<bool> {
        Ok(Self::root(location)?.is_dir())
    }

    async fn create_if_missing(&self, location: &StorageLocation) -> StorageResult<()> {
        fs::create_dir_all(Self::root(location)?).await?;
        Ok(())
    }
}
