//! Storage locations and the storage client abstraction.
//!
//! A storage location is written as a single descriptor string:
//!
//! - object stores: `<provider>://<bucket>/<cluster>/<datacenter>[/<node>]`
//! - filesystem: `file://<root>/<bucket>/<cluster>/<datacenter>/<node>`
//!
//! Everything a backup writes for one node lives under `<cluster>/<datacenter>/<node>/`
//! inside the bucket (see [`crate::manifest`] for the key layout).

pub(crate) mod factory;
pub mod local;
pub mod s3;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::BackupError;

pub use factory::create_client;
pub use local::LocalStorageClient;
pub use s3::S3StorageClient;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

// EDQUOT, a per-user quota rather than a full device.
#[cfg(target_os = "linux")]
const EDQUOT: i32 = 122;

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            StorageError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

pub(crate) fn is_transient_io(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    #[cfg(target_os = "linux")]
    if error.raw_os_error() == Some(EDQUOT) {
        return true;
    }

    matches!(
        error.kind(),
        ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::StorageFull
            | ErrorKind::ResourceBusy
    )
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Backends a descriptor may name. Which of them are usable is decided by the
/// deployment (`storage_providers` in `config.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    S3,
    Minio,
    Ceph,
    Oracle,
    Gcp,
    Azure,
    File,
}

impl StorageProvider {
    pub const ALL: [StorageProvider; 7] = [
        StorageProvider::S3,
        StorageProvider::Minio,
        StorageProvider::Ceph,
        StorageProvider::Oracle,
        StorageProvider::Gcp,
        StorageProvider::Azure,
        StorageProvider::File,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Minio => "minio",
            StorageProvider::Ceph => "ceph",
            StorageProvider::Oracle => "oracle",
            StorageProvider::Gcp => "gcp",
            StorageProvider::Azure => "azure",
            StorageProvider::File => "file",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.token() == token)
    }

    /// Reachable through the local filesystem, no network transfer involved.
    pub fn is_filesystem(&self) -> bool {
        matches!(self, StorageProvider::File)
    }

    /// Spoken to through the S3 API.
    pub fn is_s3_compatible(&self) -> bool {
        matches!(
            self,
            StorageProvider::S3 | StorageProvider::Minio | StorageProvider::Ceph | StorageProvider::Oracle
        )
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Where a backup lives. Parsed once from a descriptor and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageLocation {
    pub provider: StorageProvider,
    pub bucket: String,
    pub cluster_id: String,
    pub datacenter: String,
    pub node_id: Option<String>,
    /// Filesystem root the bucket directory lives in; only set for `file`.
    pub path_prefix: Option<String>,
}

impl StorageLocation {
    pub fn parse(descriptor: &str) -> Result<Self, BackupError> {
        let invalid = |reason: &str| BackupError::InvalidLocation {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = descriptor
            .split_once("://")
            .ok_or_else(|| invalid("expected '<provider>://...'"))?;
        let provider = StorageProvider::from_token(scheme)
            .ok_or_else(|| invalid(&format!("unrecognized storage provider '{scheme}'")))?;

        if provider.is_filesystem() {
            let path = rest
                .strip_prefix('/')
                .ok_or_else(|| invalid("filesystem location must be an absolute path"))?;
            let segments = split_segments(path).ok_or_else(|| invalid("empty path segment"))?;
            if segments.len() < 4 {
                return Err(invalid(
                    "expected file://<root>/<bucket>/<cluster>/<datacenter>/<node>",
                ));
            }
            let split = segments.len() - 4;
            let prefix = format!("/{}", segments[..split].join("/"));
            return Ok(StorageLocation {
                provider,
                bucket: segments[split].to_string(),
                cluster_id: segments[split + 1].to_string(),
                datacenter: segments[split + 2].to_string(),
                node_id: Some(segments[split + 3].to_string()),
                path_prefix: Some(prefix),
            });
        }

        let segments = split_segments(rest).ok_or_else(|| invalid("empty path segment"))?;
        match segments.as_slice() {
            [bucket, cluster, dc] => Ok(StorageLocation {
                provider,
                bucket: bucket.to_string(),
                cluster_id: cluster.to_string(),
                datacenter: dc.to_string(),
                node_id: None,
                path_prefix: None,
            }),
            [bucket, cluster, dc, node] => Ok(StorageLocation {
                provider,
                bucket: bucket.to_string(),
                cluster_id: cluster.to_string(),
                datacenter: dc.to_string(),
                node_id: Some(node.to_string()),
                path_prefix: None,
            }),
            _ => Err(invalid(
                "expected <provider>://<bucket>/<cluster>/<datacenter>[/<node>]",
            )),
        }
    }

    /// The same location scoped to another node, possibly in another datacenter.
    pub fn for_node(&self, datacenter: &str, node_id: &str) -> Self {
        StorageLocation {
            datacenter: datacenter.to_string(),
            node_id: Some(node_id.to_string()),
            ..self.clone()
        }
    }

    pub fn require_node(&self) -> Result<&str, BackupError> {
        self.node_id.as_deref().ok_or_else(|| {
            BackupError::InvalidRequest(format!(
                "storage location {self} does not name a node"
            ))
        })
    }

    /// Key prefix of everything stored for this location's node.
    pub fn node_prefix(&self) -> Result<String, BackupError> {
        let node = self.require_node()?;
        Ok(format!("{}/{}/{}", self.cluster_id, self.datacenter, node))
    }

    /// Bucket directory for the `file` provider.
    pub fn local_root(&self) -> Option<PathBuf> {
        self.path_prefix
            .as_ref()
            .map(|prefix| Path::new(prefix).join(&self.bucket))
    }

    pub fn is_filesystem(&self) -> bool {
        self.provider.is_filesystem()
    }
}

fn split_segments(path: &str) -> Option<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        None
    } else {
        Some(segments)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.provider)?;
        if let Some(prefix) = &self.path_prefix {
            write!(f, "{}/", prefix.trim_end_matches('/'))?;
        }
        write!(f, "{}/{}/{}", self.bucket, self.cluster_id, self.datacenter)?;
        if let Some(node) = &self.node_id {
            write!(f, "/{node}")?;
        }
        Ok(())
    }
}

impl FromStr for StorageLocation {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageLocation::parse(s)
    }
}

impl TryFrom<String> for StorageLocation {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageLocation::parse(&value)
    }
}

impl From<StorageLocation> for String {
    fn from(location: StorageLocation) -> Self {
        location.to_string()
    }
}

/// One object in a bucket, keyed relative to the bucket root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

/// Byte-level access to one storage provider. Every call is a single remote
/// operation that callers may retry under a [`crate::retry::RetrySpec`].
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Every object under `prefix` in the location's bucket.
    async fn list(&self, location: &StorageLocation, prefix: &str) -> StorageResult<Vec<RemoteObject>>;

    /// Streams an object into `destination`, returning the bytes written.
    async fn get(&self, location: &StorageLocation, key: &str, destination: &Path) -> StorageResult<u64>;

    async fn put(&self, location: &StorageLocation, key: &str, source: &Path) -> StorageResult<()>;

    async fn read(&self, location: &StorageLocation, key: &str) -> StorageResult<Vec<u8>>;

    async fn write(&self, location: &StorageLocation, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Bumps the modification time of an existing object so age-based retention
    /// treats it as part of the newest backup.
    async fn refresh(&self, location: &StorageLocation, key: &str) -> StorageResult<()>;

    /// Whether the location's bucket (or root directory) exists.
    async fn exists(&self, location: &StorageLocation) -> StorageResult<bool>;

    async fn create_if_missing(&self, location: &StorageLocation) -> StorageResult<()>;
}

impl StorageLocation {
    /// Checks the backend can be reached and the bucket exists, creating it when
    /// `create_missing` is set.
    pub async fn validate_exists(
        &self,
        client: &dyn StorageClient,
        create_missing: bool,
    ) -> Result<(), BackupError> {
        let unreachable = |reason: String| BackupError::LocationUnreachable {
            location: self.to_string(),
            reason,
        };

        let exists = client
            .exists(self)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        if exists {
            return Ok(());
        }

        if !create_missing {
            return Err(unreachable(format!(
                "bucket '{}' does not exist and creation of missing buckets is disabled",
                self.bucket
            )));
        }

        tracing::info!(location = %self, bucket = %self.bucket, "Creating missing bucket");
        client
            .create_if_missing(self)
            .await
            .map_err(|e| unreachable(format!("failed to create bucket '{}': {e}", self.bucket)))
    }
}
