//! What a backup writes to storage and where.
//!
//! For a node with prefix `<cluster>/<dc>/<node>` a backup tagged `t` consists of:
//!
//! - `<prefix>/data/<keyspace>/<table>-<id>/<file>` for every snapshot file
//! - `<prefix>/schema/t.cql`, the schema at snapshot time
//! - `<prefix>/manifests/t.json`, written last
//!
//! and, when topology upload is on, `<cluster>/topology/t.json`.
//!
//! Data keys carry the table id, not the snapshot tag. SSTables are immutable, so
//! backups of the same table share files, while a dropped and recreated table gets
//! a fresh directory even though its SSTable generations start over.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::BackupError;
use crate::storage::RemoteObject;

pub fn data_key(node_prefix: &str, keyspace: &str, table_dir: &str, file_name: &str) -> String {
    format!("{node_prefix}/data/{keyspace}/{table_dir}/{file_name}")
}

/// `<table>-<id>`, or just the table name for a table without an id.
pub fn table_dir_name(table: &str, table_id: Option<&str>) -> String {
    match table_id {
        Some(id) => format!("{table}-{id}"),
        None => table.to_string(),
    }
}

pub fn data_prefix(node_prefix: &str) -> String {
    format!("{node_prefix}/data/")
}

pub fn manifest_key(node_prefix: &str, snapshot_tag: &str) -> String {
    format!("{node_prefix}/manifests/{snapshot_tag}.json")
}

pub fn schema_key(node_prefix: &str, snapshot_tag: &str) -> String {
    format!("{node_prefix}/schema/{snapshot_tag}.cql")
}

pub fn topology_key(cluster_id: &str, snapshot_tag: &str) -> String {
    format!("{cluster_id}/topology/{snapshot_tag}.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub keyspace: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    pub file_name: String,
    pub size: u64,
}

impl ManifestEntry {
    pub fn key(&self, node_prefix: &str) -> String {
        let table_dir = table_dir_name(&self.table, self.table_id.as_deref());
        data_key(node_prefix, &self.keyspace, &table_dir, &self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub snapshot_tag: String,
    #[serde(default)]
    pub schema_version: Option<String>,
    pub node_id: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BackupError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BackupError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Checks every listed file is present in the remote inventory with the recorded
    /// size.
    pub fn verify_against(
        &self,
        node_prefix: &str,
        inventory: &[RemoteObject],
    ) -> Result<(), BackupError> {
        let sizes: HashMap<&str, u64> = inventory
            .iter()
            .map(|object| (object.key.as_str(), object.size))
            .collect();

        let missing: Vec<String> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let key = entry.key(node_prefix);
                match sizes.get(key.as_str()) {
                    None => Some(key),
                    Some(&size) if size != entry.size => {
                        Some(format!("{key} (size {size}, expected {})", entry.size))
                    }
                    Some(_) => None,
                }
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BackupError::IncompleteBackup {
                snapshot_tag: self.snapshot_tag.clone(),
                missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            snapshot_tag: "snap".to_string(),
            schema_version: Some("v1".to_string()),
            node_id: "n1".to_string(),
            entries: vec![
                ManifestEntry {
                    keyspace: "ks".to_string(),
                    table: "t".to_string(),
                    table_id: None,
                    file_name: "nb-1-big-Data.db".to_string(),
                    size: 10,
                },
                ManifestEntry {
                    keyspace: "ks".to_string(),
                    table: "t".to_string(),
                    table_id: None,
                    file_name: "f.db".to_string(),
                    size: 4,
                },
            ],
        }
    }

    #[test]
    fn key_layout() {
        assert_eq!(data_key("c/d/n", "ks", "t-a1", "f.db"), "c/d/n/data/ks/t-a1/f.db");
        assert_eq!(table_dir_name("t", Some("a1")), "t-a1");
        assert_eq!(table_dir_name("t", None), "t");
        assert_eq!(manifest_key("c/d/n", "snap"), "c/d/n/manifests/snap.json");
        assert_eq!(schema_key("c/d/n", "snap"), "c/d/n/schema/snap.cql");
        assert_eq!(topology_key("c", "snap"), "c/topology/snap.json");
    }

    #[test]
    fn complete_inventory_verifies() {
        let inventory = vec![
            RemoteObject { key: "c/d/n1/data/ks/t/nb-1-big-Data.db".to_string(), size: 10 },
            RemoteObject { key: "c/d/n1/data/ks/t/f.db".to_string(), size: 4 },
            RemoteObject { key: "c/d/n1/data/ks/t/unrelated.db".to_string(), size: 1 },
        ];
        manifest().verify_against("c/d/n1", &inventory).unwrap();
    }

    #[test]
    fn missing_file_makes_backup_incomplete() {
        let inventory = vec![RemoteObject {
            key: "c/d/n1/data/ks/t/nb-1-big-Data.db".to_string(),
            size: 10,
        }];
        let err = manifest().verify_against("c/d/n1", &inventory).unwrap_err();
        match err {
            BackupError::IncompleteBackup { snapshot_tag, missing } => {
                assert_eq!(snapshot_tag, "snap");
                assert_eq!(missing, vec!["c/d/n1/data/ks/t/f.db".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_file_makes_backup_incomplete() {
        let inventory = vec![
            RemoteObject { key: "c/d/n1/data/ks/t/nb-1-big-Data.db".to_string(), size: 3 },
            RemoteObject { key: "c/d/n1/data/ks/t/f.db".to_string(), size: 4 },
        ];
        let err = manifest().verify_against("c/d/n1", &inventory).unwrap_err();
        assert!(err.to_string().contains("expected 10"));
    }
}
