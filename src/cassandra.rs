// cassandratool/src/cassandra.rs
//! The database side of backup and restore: snapshots, schema, and SSTable import.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use walkdir::WalkDir;
use which::which;

use crate::errors::BackupError;
use crate::request::DatabaseEntities;

/// Operations the tool needs from the local database node.
#[async_trait]
pub trait CassandraNode: Send + Sync {
    async fn take_snapshot(&self, tag: &str, entities: &DatabaseEntities) -> Result<(), BackupError>;

    async fn clear_snapshot(&self, tag: &str) -> Result<(), BackupError>;

    async fn schema_version(&self) -> Result<String, BackupError>;

    /// CQL describing the current schema.
    async fn describe_schema(&self) -> Result<String, BackupError>;

    async fn apply_schema(&self, cql_file: &Path) -> Result<(), BackupError>;

    /// Loads staged SSTables, laid out as `<staging>/<keyspace>/<table>/`, into the
    /// running node.
    async fn import_sstables(&self, entities: &DatabaseEntities, staging: &Path) -> Result<(), BackupError>;
}

/// One file of an on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub keyspace: String,
    pub table: String,
    /// Id suffix of the table's data directory, if it has one.
    pub table_id: Option<String>,
    pub path: PathBuf,
    pub size: u64,
}

/// Splits a data directory name such as `users-5a1c395e...` into table and id.
pub fn split_table_dir(dir_name: &str) -> (&str, Option<&str>) {
    match dir_name.rsplit_once('-') {
        Some((table, id))
            if !table.is_empty() && !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            (table, Some(id))
        }
        _ => (dir_name, None),
    }
}

/// Table name from a data directory name.
pub fn table_from_dir_name(dir_name: &str) -> &str {
    split_table_dir(dir_name).0
}

/// Files of snapshot `tag` under `<cassandra_dir>/data/<ks>/<table>-<id>/snapshots/<tag>/`.
pub fn snapshot_files(
    cassandra_dir: &Path,
    tag: &str,
    entities: &DatabaseEntities,
) -> Result<Vec<SnapshotFile>, BackupError> {
    let data_dir = cassandra_dir.join("data");
    if !data_dir.is_dir() {
        return Err(BackupError::InvalidRequest(format!(
            "data directory {} does not exist",
            data_dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&data_dir).min_depth(5).max_depth(5) {
        let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&data_dir)
            .map_err(|e| BackupError::Database(e.to_string()))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        // <ks>/<table-id>/snapshots/<tag>/<file>
        if parts.len() != 5 || parts[2] != "snapshots" || parts[3] != tag {
            continue;
        }
        let keyspace = parts[0].clone();
        let (table, table_id) = split_table_dir(&parts[1]);
        if !entities.includes(&keyspace, table) {
            continue;
        }
        let table = table.to_string();
        let table_id = table_id.map(String::from);
        let size = entry.metadata().map_err(|e| BackupError::Io(e.into()))?.len();
        files.push(SnapshotFile {
            keyspace,
            table,
            table_id,
            path: entry.path().to_path_buf(),
            size,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Live data directory of a table, `<cassandra_dir>/data/<ks>/<table>-<id>`, or
/// `<cassandra_dir>/data/<ks>/<table>` when the table has none yet.
pub fn live_table_dir(cassandra_dir: &Path, keyspace: &str, table: &str) -> Result<PathBuf, BackupError> {
    let keyspace_dir = cassandra_dir.join("data").join(keyspace);
    if keyspace_dir.is_dir() {
        for entry in std::fs::read_dir(&keyspace_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && name != table && table_from_dir_name(&name) == table {
                return Ok(entry.path());
            }
        }
    }
    Ok(keyspace_dir.join(table))
}

static SCHEMA_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\s*:")
        .expect("schema version pattern is valid")
});

/// First schema version listed in `nodetool describecluster` output.
pub fn parse_schema_version(describecluster: &str) -> Option<String> {
    let section = describecluster
        .split_once("Schema versions:")
        .map(|(_, rest)| rest)?;
    SCHEMA_VERSION
        .captures(section)
        .and_then(|c| uuid::Uuid::parse_str(&c[1]).ok())
        .map(|version| version.to_string())
}

/// Talks to the local node through `nodetool` and `cqlsh`.
#[derive(Debug, Clone)]
pub struct Nodetool {
    nodetool: PathBuf,
    cqlsh: PathBuf,
}

/// Finds an executable in PATH unless a path was configured.
fn find_executable(name: &str, configured: Option<&Path>) -> Result<PathBuf, BackupError> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => which(name).map_err(|e| {
            BackupError::Database(format!(
                "{name} executable not found in PATH ({e}). Please ensure Cassandra tools are installed and in your PATH."
            ))
        }),
    }
}

impl Nodetool {
    pub fn locate(nodetool: Option<&Path>, cqlsh: Option<&Path>) -> Result<Self, BackupError> {
        Ok(Nodetool {
            nodetool: find_executable("nodetool", nodetool)?,
            cqlsh: find_executable("cqlsh", cqlsh)?,
        })
    }

    async fn run(&self, program: &Path, args: &[String]) -> Result<String, BackupError> {
        tracing::debug!(program = %program.display(), args = ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| BackupError::Database(format!("failed to execute {}: {e}", program.display())))?;

        if !output.status.success() {
            return Err(BackupError::Database(format!(
                "{} {} failed with status: {}\nStdout: {}\nStderr: {}",
                program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CassandraNode for Nodetool {
    async fn take_snapshot(&self, tag: &str, entities: &DatabaseEntities) -> Result<(), BackupError> {
        let mut args = vec!["snapshot".to_string(), "-t".to_string(), tag.to_string()];
        let whole_keyspaces_only = entities
            .entities()
            .iter()
            .all(|e| matches!(e, crate::request::Entity::Keyspace(_)));
        if !entities.is_all() {
            if whole_keyspaces_only {
                args.extend(entities.keyspaces().into_iter().map(String::from));
            } else {
                args.push("-kt".to_string());
                args.push(entities.to_string());
            }
        }
        self.run(&self.nodetool, &args).await?;
        tracing::info!(snapshot_tag = %tag, entities = %entities, "Snapshot taken");
        Ok(())
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<(), BackupError> {
        self.run(
            &self.nodetool,
            &["clearsnapshot".to_string(), "-t".to_string(), tag.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<String, BackupError> {
        let output = self.run(&self.nodetool, &["describecluster".to_string()]).await?;
        parse_schema_version(&output).ok_or_else(|| {
            BackupError::Database("no schema version in nodetool describecluster output".to_string())
        })
    }

    async fn describe_schema(&self) -> Result<String, BackupError> {
        self.run(&self.cqlsh, &["-e".to_string(), "DESCRIBE SCHEMA".to_string()])
            .await
    }

    async fn apply_schema(&self, cql_file: &Path) -> Result<(), BackupError> {
        self.run(&self.cqlsh, &["-f".to_string(), cql_file.display().to_string()])
            .await?;
        Ok(())
    }

    async fn import_sstables(&self, entities: &DatabaseEntities, staging: &Path) -> Result<(), BackupError> {
        let mut imported = 0;
        for keyspace_entry in std::fs::read_dir(staging)? {
            let keyspace_entry = keyspace_entry?;
            if !keyspace_entry.file_type()?.is_dir() {
                continue;
            }
            let keyspace = keyspace_entry.file_name().to_string_lossy().into_owned();
            for table_entry in std::fs::read_dir(keyspace_entry.path())? {
                let table_entry = table_entry?;
                let table = table_entry.file_name().to_string_lossy().into_owned();
                if !table_entry.file_type()?.is_dir() || !entities.includes(&keyspace, &table) {
                    continue;
                }
                let args = vec![
                    "import".to_string(),
                    keyspace.clone(),
                    table.clone(),
                    table_entry.path().display().to_string(),
                ];
                self.run(&self.nodetool, &args)
                    .await
                    .map_err(|e| BackupError::Import(format!("{keyspace}.{table}: {e}")))?;
                imported += 1;
            }
        }
        tracing::info!(tables = imported, staging = %staging.display(), "Imported SSTables");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records the calls made against it instead of touching a database.
    #[derive(Default)]
    pub(crate) struct RecordingNode {
        pub(crate) calls: Mutex<Vec<String>>,
        /// `<keyspace>/<table>/<file>` of everything present at import time.
        pub(crate) imported: Mutex<Vec<String>>,
        pub(crate) fail_import: bool,
    }

    impl RecordingNode {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl CassandraNode for RecordingNode {
        async fn take_snapshot(&self, tag: &str, _entities: &DatabaseEntities) -> Result<(), BackupError> {
            self.record(format!("snapshot {tag}"));
            Ok(())
        }

        async fn clear_snapshot(&self, tag: &str) -> Result<(), BackupError> {
            self.record(format!("clearsnapshot {tag}"));
            Ok(())
        }

        async fn schema_version(&self) -> Result<String, BackupError> {
            Ok("59adb24e-f3cd-3e02-97f0-5b395827453f".to_string())
        }

        async fn describe_schema(&self) -> Result<String, BackupError> {
            Ok("CREATE KEYSPACE ks WITH replication = {'class': 'SimpleStrategy'};".to_string())
        }

        async fn apply_schema(&self, cql_file: &Path) -> Result<(), BackupError> {
            let cql = std::fs::read_to_string(cql_file)?;
            self.record(format!("schema {}", cql.len()));
            Ok(())
        }

        async fn import_sstables(&self, _entities: &DatabaseEntities, staging: &Path) -> Result<(), BackupError> {
            self.record("import".to_string());
            if self.fail_import {
                return Err(BackupError::Import("nodetool import exited with 1".to_string()));
            }
            let mut imported = self.imported.lock().unwrap();
            for entry in WalkDir::new(staging).min_depth(3).max_depth(3) {
                let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
                let relative = entry.path().strip_prefix(staging).unwrap();
                imported.push(relative.to_string_lossy().into_owned());
            }
            imported.sort();
            Ok(())
        }
    }
}
