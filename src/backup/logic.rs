use std::collections::HashMap;

use crate::cassandra::{CassandraNode, SnapshotFile, snapshot_files};
use crate::coordinator::{ClusterTopology, upload_topology};
use crate::errors::{BackupError, Result};
use crate::manifest::{
    Manifest, ManifestEntry, data_key, data_prefix, manifest_key, schema_key, table_dir_name,
};
use crate::request::{BackupOperationRequest, Validated};
use crate::retry::retry;
use crate::storage::{StorageClient, StorageError, StorageLocation};
use crate::transfer::{TransferSettings, run_transfers};

/// What one node's backup put into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub snapshot_tag: String,
    pub node_id: String,
    pub files: usize,
    /// Bytes uploaded by this run; files already in storage add nothing.
    pub bytes: u64,
    /// Files that were already in storage with the same size.
    pub reused: usize,
    pub schema_version: String,
}

pub(crate) async fn perform_backup(
    request: &mut Validated<BackupOperationRequest>,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
    topology: Option<&ClusterTopology>,
) -> Result<BackupSummary> {
    let location = request.base.storage_location.clone();
    location.require_node()?;

    if request.base.skip_bucket_verification {
        tracing::debug!(location = %location, "Skipping bucket verification");
    } else {
        location
            .validate_exists(storage, request.base.create_missing_bucket)
            .await?;
    }

    let tag = request.snapshot_tag.clone();
    node.take_snapshot(&tag, &request.entities).await?;

    match upload_snapshot(request, &location, storage, node, topology).await {
        Ok(summary) => {
            if let Err(e) = node.clear_snapshot(&tag).await {
                // The backup itself is complete; a stale snapshot only costs disk.
                tracing::warn!(snapshot_tag = %tag, error = %e, "Failed to clear snapshot");
            }
            Ok(summary)
        }
        Err(e) => {
            tracing::warn!(snapshot_tag = %tag, "Backup failed, snapshot left on disk");
            Err(e)
        }
    }
}

async fn upload_snapshot(
    request: &mut Validated<BackupOperationRequest>,
    location: &StorageLocation,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
    topology: Option<&ClusterTopology>,
) -> Result<BackupSummary> {
    let tag = request.snapshot_tag.clone();
    let node_id = location.require_node()?.to_string();
    let node_prefix = location.node_prefix()?;
    let retry_spec = request.base.retry.clone();

    let schema_version = node.schema_version().await?;
    request.record_schema_version(schema_version.clone());

    let files = snapshot_files(request.base.cassandra_directory(), &tag, &request.entities)?;

    let settings = TransferSettings {
        retry: retry_spec.clone(),
        concurrency: request.base.concurrent_connections as usize,
        bandwidth: request.base.bandwidth,
    };

    // SSTables never change once written, so an object with the same key and size
    // is the same file uploaded by an earlier backup.
    let prefix = data_prefix(&node_prefix);
    let inventory: HashMap<String, u64> = retry(&retry_spec, &prefix, StorageError::is_transient, || {
        storage.list(location, &prefix)
    })
    .await?
    .into_iter()
    .map(|object| (object.key, object.size))
    .collect();

    let mut uploads = Vec::new();
    let mut present = Vec::new();
    for file in &files {
        let key = object_key(&node_prefix, file)?;
        if inventory.get(&key) == Some(&file.size) {
            present.push(key);
        } else {
            uploads.push((key, file.clone()));
        }
    }
    let reused = present.len();
    tracing::info!(snapshot_tag = %tag, upload = uploads.len(), reused, "Uploading snapshot files");

    let bytes = run_transfers(
        uploads,
        &settings,
        |(key, _): &(String, SnapshotFile)| key.clone(),
        |(key, file): (String, SnapshotFile)| async move {
            storage.put(location, &key, &file.path).await?;
            Ok::<u64, StorageError>(file.size)
        },
    )
    .await?;

    if request.base.skip_refreshing {
        tracing::debug!(reused, "Leaving existing objects untouched");
    } else {
        run_transfers(
            present,
            &settings,
            |key: &String| key.clone(),
            |key: String| async move {
                storage.refresh(location, &key).await?;
                Ok::<u64, StorageError>(0)
            },
        )
        .await?;
    }

    let schema = node.describe_schema().await?;
    let key = schema_key(&node_prefix, &tag);
    retry(&retry_spec, &key, StorageError::is_transient, || {
        storage.write(location, &key, schema.clone().into_bytes())
    })
    .await?;

    if request.upload_cluster_topology {
        let topology = topology.ok_or_else(|| {
            BackupError::Topology(
                "uploadClusterTopology is set but no cluster topology is configured".to_string(),
            )
        })?;
        upload_topology(storage, location, &tag, topology, &retry_spec).await?;
    }

    let entries = files
        .iter()
        .map(|file| -> std::result::Result<ManifestEntry, StorageError> {
            Ok(ManifestEntry {
                keyspace: file.keyspace.clone(),
                table: file.table.clone(),
                table_id: file.table_id.clone(),
                file_name: file_name(file)?,
                size: file.size,
            })
        })
        .collect::<std::result::Result<Vec<_>, StorageError>>()?;
    let manifest = Manifest {
        snapshot_tag: tag.clone(),
        schema_version: Some(schema_version.clone()),
        node_id: node_id.clone(),
        entries,
    };
    let body = manifest.to_bytes()?;
    let key = manifest_key(&node_prefix, &tag);
    retry(&retry_spec, &key, StorageError::is_transient, || {
        storage.write(location, &key, body.clone())
    })
    .await?;

    tracing::info!(snapshot_tag = %tag, node = %node_id, files = files.len(), bytes, reused, "Backup uploaded");
    Ok(BackupSummary {
        snapshot_tag: tag,
        node_id,
        files: files.len(),
        bytes,
        reused,
        schema_version,
    })
}

fn object_key(node_prefix: &str, file: &SnapshotFile) -> std::result::Result<String, StorageError> {
    let table_dir = table_dir_name(&file.table, file.table_id.as_deref());
    Ok(data_key(node_prefix, &file.keyspace, &table_dir, &file_name(file)?))
}

fn file_name(file: &SnapshotFile) -> std::result::Result<String, StorageError> {
    file.path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| StorageError::Backend(format!("{} has no file name", file.path.display())))
}
