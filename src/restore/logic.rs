use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cassandra::{CassandraNode, live_table_dir};
use crate::errors::{BackupError, Result};
use crate::manifest::{Manifest, data_prefix, manifest_key, schema_key};
use crate::request::{RestoreOperationRequest, Validated};
use crate::retry::{RetrySpec, retry};
use crate::storage::{
    LocalStorageClient, StorageClient, StorageError, StorageLocation, StorageResult,
};
use crate::transfer::{TransferSettings, run_transfers};

use super::resolver::{DataAcquisition, RestorationStrategy, resolve};

const STAGING_DIR: &str = "downloads";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub snapshot_tag: String,
    pub strategy: RestorationStrategy,
    pub files: usize,
    pub bytes: u64,
    pub schema_restored: bool,
}

/// One backup file and where it goes on this node.
#[derive(Debug, Clone)]
struct Placement {
    key: String,
    destination: PathBuf,
    size: u64,
}

fn staging_dir(cassandra_dir: &Path, snapshot_tag: &str) -> PathBuf {
    cassandra_dir.join(STAGING_DIR).join(snapshot_tag)
}

pub(crate) async fn perform_restore(
    request: &Validated<RestoreOperationRequest>,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
) -> Result<RestoreSummary> {
    let strategy = resolve(request)?;
    let location = &request.base.storage_location;
    let tag = request.snapshot_tag.as_str();
    let node_prefix = location.node_prefix()?;
    let retry_spec = &request.base.retry;
    tracing::info!(
        snapshot_tag = %tag,
        strategy = %strategy,
        source = ?request.source_node_id(),
        target = ?request.target_node_id(),
        "Resolved restoration strategy"
    );

    if request.base.skip_bucket_verification {
        tracing::debug!(location = %location, "Skipping bucket verification");
    } else {
        // A restore never creates the bucket it reads from.
        location.validate_exists(storage, false).await?;
    }

    let key = manifest_key(&node_prefix, tag);
    let bytes = retry(retry_spec, &key, StorageError::is_transient, || {
        storage.read(location, &key)
    })
    .await?;
    let mut manifest = Manifest::from_bytes(&bytes)?;
    let absent: Vec<String> = request
        .entities
        .entities()
        .iter()
        .filter(|entity| {
            !manifest
                .entries
                .iter()
                .any(|entry| entity.matches(&entry.keyspace, &entry.table))
        })
        .map(ToString::to_string)
        .collect();
    if !absent.is_empty() {
        return Err(BackupError::InvalidRequest(format!(
            "backup '{tag}' holds nothing for: {}",
            absent.join(", ")
        )));
    }
    manifest
        .entries
        .retain(|entry| request.entities.includes(&entry.keyspace, &entry.table));

    let prefix = data_prefix(&node_prefix);
    let inventory = retry(retry_spec, &prefix, StorageError::is_transient, || {
        storage.list(location, &prefix)
    })
    .await?;
    manifest.verify_against(&node_prefix, &inventory)?;

    let cassandra_dir = request.base.cassandra_directory();
    let staging = staging_dir(cassandra_dir, tag);
    if strategy.imports() {
        reset_dir(&staging).await?;
    }

    let placements = manifest
        .entries
        .iter()
        .map(|entry| -> Result<Placement> {
            let table_dir = if strategy.imports() {
                staging.join(&entry.keyspace).join(&entry.table)
            } else {
                live_table_dir(cassandra_dir, &entry.keyspace, &entry.table)?
            };
            Ok(Placement {
                key: entry.key(&node_prefix),
                destination: table_dir.join(&entry.file_name),
                size: entry.size,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let acquisition = strategy.acquisition();
    let settings = TransferSettings {
        // Links are local metadata operations with nothing worth retrying.
        retry: match acquisition {
            DataAcquisition::Hardlink => RetrySpec::none(),
            _ => retry_spec.clone(),
        },
        concurrency: request.base.concurrent_connections as usize,
        bandwidth: match acquisition {
            DataAcquisition::Hardlink => None,
            _ => request.base.bandwidth,
        },
    };
    let files = placements.len();
    let bytes = run_transfers(
        placements,
        &settings,
        |placement: &Placement| placement.key.clone(),
        |placement: Placement| async move { acquire(acquisition, storage, location, &placement).await },
    )
    .await?;
    tracing::info!(snapshot_tag = %tag, files, bytes, "Backup files placed");

    if strategy.imports() {
        let imported = if files == 0 {
            tracing::warn!(snapshot_tag = %tag, entities = %request.entities, "Nothing to import");
            Ok(())
        } else {
            node.import_sstables(&request.entities, &staging).await
        };
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(staging = %staging.display(), error = %e, "Failed to remove staging directory");
        }
        imported?;
    } else {
        tracing::info!(snapshot_tag = %tag, "Files are in the live data directories; restart the node to load them");
    }

    // Runs only once data placement has succeeded.
    if request.restore_schema {
        restore_schema(request, storage, node, &node_prefix).await?;
    }

    Ok(RestoreSummary {
        snapshot_tag: tag.to_string(),
        strategy,
        files,
        bytes,
        schema_restored: request.restore_schema,
    })
}

async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

async fn acquire(
    acquisition: DataAcquisition,
    storage: &dyn StorageClient,
    location: &StorageLocation,
    placement: &Placement,
) -> StorageResult<u64> {
    if let Some(parent) = placement.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match acquisition {
        DataAcquisition::Hardlink => {
            let source = LocalStorageClient::key_to_path(location, &placement.key)?;
            match tokio::fs::remove_file(&placement.destination).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::hard_link(&source, &placement.destination)
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => StorageError::NotFound(placement.key.clone()),
                    _ => StorageError::Io(e),
                })?;
            Ok(placement.size)
        }
        DataAcquisition::Copy => {
            LocalStorageClient::new()
                .get(location, &placement.key, &placement.destination)
                .await
        }
        DataAcquisition::Download => storage.get(location, &placement.key, &placement.destination).await,
    }
}

async fn restore_schema(
    request: &Validated<RestoreOperationRequest>,
    storage: &dyn StorageClient,
    node: &dyn CassandraNode,
    node_prefix: &str,
) -> Result<()> {
    let location = &request.base.storage_location;
    let key = schema_key(node_prefix, &request.snapshot_tag);
    let path = request
        .base
        .cassandra_directory()
        .join(STAGING_DIR)
        .join(format!("{}.cql", request.snapshot_tag));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    retry(&request.base.retry, &key, StorageError::is_transient, || {
        storage.get(location, &key, &path)
    })
    .await?;
    let applied = node.apply_schema(&path).await;
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove downloaded schema");
    }
    applied?;
    tracing::info!(snapshot_tag = %request.snapshot_tag, "Schema restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cassandra::testing::RecordingNode;
    use crate::manifest::ManifestEntry;
    use crate::request::ValidationEnvironment;
    use crate::request::testing::{StaticSecrets, all_providers};
    use crate::storage::memory::MemoryStorage;
    use serde_json::json;

    const SCHEMA: &[u8] = b"CREATE TABLE ks.users (id int PRIMARY KEY);";

    fn validated(value: serde_json::Value) -> Validated<RestoreOperationRequest> {
        let request: RestoreOperationRequest = serde_json::from_value(value).unwrap();
        let providers = all_providers();
        let secrets = StaticSecrets::unmanaged();
        request
            .validate(&ValidationEnvironment {
                supported_providers: &providers,
                secrets: &secrets,
            })
            .unwrap()
    }

    fn manifest(prefix: &str, files: &[(&str, &[u8])]) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
        let entries: Vec<ManifestEntry> = files
            .iter()
            .map(|(name, data)| ManifestEntry {
                keyspace: "ks".to_string(),
                table: "users".to_string(),
                table_id: None,
                file_name: name.to_string(),
                size: data.len() as u64,
            })
            .collect();
        let objects = entries
            .iter()
            .zip(files)
            .map(|(entry, (_, data))| (entry.key(prefix), data.to_vec()))
            .collect();
        let manifest = Manifest {
            snapshot_tag: "snap".to_string(),
            schema_version: None,
            node_id: "n1".to_string(),
            entries,
        };
        (manifest.to_bytes().unwrap(), objects)
    }

    fn seeded_memory(skip: Option<&str>) -> MemoryStorage {
        let storage = MemoryStorage::with_bucket("bucket");
        let (body, objects) = manifest("prod/dc1/n1", &[("nb-1-big-Data.db", b"data"), ("f.db", b"ff")]);
        storage.insert("prod/dc1/n1/manifests/snap.json", &body);
        storage.insert("prod/dc1/n1/schema/snap.cql", SCHEMA);
        for (key, data) in objects {
            if skip.is_none_or(|s| !key.ends_with(s)) {
                storage.insert(&key, &data);
            }
        }
        storage
    }

    #[tokio::test]
    async fn downloads_imports_then_restores_schema() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "restoreSchema": true,
        }));
        let storage = seeded_memory(None);
        let node = RecordingNode::default();

        let summary = perform_restore(&request, &storage, &node).await.unwrap();

        assert_eq!(summary.strategy, RestorationStrategy::DownloadAndImport);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 6);
        assert_eq!(
            *node.imported.lock().unwrap(),
            vec!["ks/users/f.db", "ks/users/nb-1-big-Data.db"]
        );
        assert_eq!(node.calls(), vec!["import".to_string(), format!("schema {}", SCHEMA.len())]);
        assert!(!staging_dir(dir.path(), "snap").exists());
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_download_or_import() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
        }));
        let storage = seeded_memory(Some("/f.db"));
        let node = RecordingNode::default();

        let err = perform_restore(&request, &storage, &node).await.unwrap_err();
        match err {
            BackupError::IncompleteBackup { missing, .. } => {
                assert_eq!(missing, vec!["prod/dc1/n1/data/ks/users/f.db".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(storage.get_count(), 0);
        assert!(node.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_download_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "retry": {"maxAttempts": 3},
        }));
        let storage = seeded_memory(None);
        storage
            .flaky
            .lock()
            .unwrap()
            .insert("prod/dc1/n1/data/ks/users/f.db".to_string(), 2);
        let node = RecordingNode::default();

        perform_restore(&request, &storage, &node).await.unwrap();
        assert_eq!(storage.get_count(), 4);
        assert_eq!(node.calls(), vec!["import"]);
    }

    #[tokio::test]
    async fn import_failure_skips_schema() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "restoreSchema": true,
        }));
        let storage = seeded_memory(None);
        let node = RecordingNode {
            fail_import: true,
            ..Default::default()
        };

        let err = perform_restore(&request, &storage, &node).await.unwrap_err();
        assert!(matches!(err, BackupError::Import(_)));
        assert_eq!(node.calls(), vec!["import"]);
    }

    #[tokio::test]
    async fn entity_filter_limits_restored_tables() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "entities": "ks.users",
        }));
        let storage = seeded_memory(None);
        let node = RecordingNode::default();

        let summary = perform_restore(&request, &storage, &node).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(node.calls(), vec!["import"]);
    }

    #[tokio::test]
    async fn entities_missing_from_backup_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "entities": "ks.users,other",
        }));
        let storage = seeded_memory(None);
        let node = RecordingNode::default();

        let err = perform_restore(&request, &storage, &node).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidRequest(_)));
        assert!(err.to_string().contains("other"));
        assert!(!err.to_string().contains("ks.users"));
        assert_eq!(storage.get_count(), 0);
        assert!(node.calls().is_empty());
    }

    #[tokio::test]
    async fn coordinator_fields_do_not_change_a_node_restore() {
        let mut outcomes = Vec::new();
        for extra in [json!({"timeout": -1, "dc": "dcX"}), json!({"timeout": 7})] {
            let dir = tempfile::tempdir().unwrap();
            let mut value = json!({
                "storageLocation": "s3://bucket/prod/dc1/n1",
                "cassandraDirectory": dir.path(),
                "snapshotTag": "snap",
                "restoreSchema": true,
            });
            value.as_object_mut().unwrap().extend(extra.as_object().unwrap().clone());
            let request = validated(value);
            let storage = seeded_memory(None);
            let node = RecordingNode::default();

            let summary = perform_restore(&request, &storage, &node).await.unwrap();
            let imported = node.imported.lock().unwrap().clone();
            outcomes.push((summary, storage.keys(), storage.get_count(), node.calls(), imported));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn older_backup_survives_table_recreation() {
        use crate::backup::run_backup_flow;
        use crate::request::BackupOperationRequest;

        let cassandra = tempfile::tempdir().unwrap();
        let data = cassandra.path().join("data/ks");
        let storage = MemoryStorage::with_bucket("bucket");
        let node = RecordingNode::default();
        let backup = |tag: &str| {
            let request: BackupOperationRequest = serde_json::from_value(json!({
                "storageLocation": "s3://bucket/prod/dc1/n1",
                "cassandraDirectory": cassandra.path(),
                "snapshotTag": tag,
            }))
            .unwrap();
            let providers = all_providers();
            let secrets = StaticSecrets::unmanaged();
            request
                .validate(&ValidationEnvironment {
                    supported_providers: &providers,
                    secrets: &secrets,
                })
                .unwrap()
        };
        let snapshot = |table_dir: &str, tag: &str, content: &[u8]| {
            let path = data.join(table_dir).join("snapshots").join(tag);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("nb-1-big-Data.db"), content).unwrap();
        };

        snapshot("users-aa11", "first", b"OLD-DATA!!");
        run_backup_flow(&mut backup("first"), &storage, &node, None).await.unwrap();

        // Dropped and recreated: new id, generation numbering starts over.
        std::fs::remove_dir_all(data.join("users-aa11")).unwrap();
        snapshot("users-bb22", "second", b"NEW-DATA!!");
        run_backup_flow(&mut backup("second"), &storage, &node, None).await.unwrap();

        let request = validated(json!({
            "storageLocation": "s3://bucket/prod/dc1/n1",
            "cassandraDirectory": cassandra.path(),
            "snapshotTag": "first",
            "restorationMode": "inPlace",
        }));
        perform_restore(&request, &storage, &node).await.unwrap();

        let restored = std::fs::read(data.join("users-bb22/nb-1-big-Data.db")).unwrap();
        assert_eq!(restored, b"OLD-DATA!!");
    }

    async fn seed_filesystem(root: &Path) -> StorageLocation {
        let location = StorageLocation::parse(&format!("file://{}/bucket/prod/dc1/n1", root.display())).unwrap();
        let local = LocalStorageClient::new();
        let (body, objects) = manifest("prod/dc1/n1", &[("nb-1-big-Data.db", b"data")]);
        local.write(&location, "prod/dc1/n1/manifests/snap.json", body).await.unwrap();
        for (key, data) in objects {
            local.write(&location, &key, data).await.unwrap();
        }
        location
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_node_filesystem_restore_links_instead_of_copying() {
        use std::os::unix::fs::MetadataExt;

        let backups = tempfile::tempdir().unwrap();
        let cassandra = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(cassandra.path().join("data/ks/users-aa11")).unwrap();
        let location = seed_filesystem(backups.path()).await;
        let request = validated(json!({
            "storageLocation": location,
            "cassandraDirectory": cassandra.path(),
            "snapshotTag": "snap",
            "restorationMode": "inPlace",
        }));
        let node = RecordingNode::default();

        let summary = perform_restore(&request, &LocalStorageClient::new(), &node).await.unwrap();
        assert_eq!(
            summary.strategy,
            RestorationStrategy::InPlace {
                acquisition: DataAcquisition::Hardlink
            }
        );

        let source = LocalStorageClient::key_to_path(&location, "prod/dc1/n1/data/ks/users/nb-1-big-Data.db").unwrap();
        let placed = cassandra.path().join("data/ks/users-aa11/nb-1-big-Data.db");
        assert_eq!(
            std::fs::metadata(&source).unwrap().ino(),
            std::fs::metadata(&placed).unwrap().ino()
        );
        assert!(node.calls().is_empty());
    }

    #[tokio::test]
    async fn other_node_filesystem_restore_copies_and_imports() {
        let backups = tempfile::tempdir().unwrap();
        let cassandra = tempfile::tempdir().unwrap();
        let location = seed_filesystem(backups.path()).await;
        let request = validated(json!({
            "storageLocation": location,
            "cassandraDirectory": cassandra.path(),
            "snapshotTag": "snap",
            "targetNodeId": "n2",
        }));
        let node = RecordingNode::default();

        let summary = perform_restore(&request, &LocalStorageClient::new(), &node).await.unwrap();
        assert_eq!(summary.strategy, RestorationStrategy::Copy);
        assert_eq!(*node.imported.lock().unwrap(), vec!["ks/users/nb-1-big-Data.db"]);
    }
}
