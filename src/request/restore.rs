use serde::{Deserialize, Serialize};

use super::{
    BaseOperationRequest, DatabaseEntities, Validated, ValidationEnvironment, default_timeout,
    effective_timeout, validate_snapshot_tag,
};
use crate::errors::BackupError;

/// Where restored data ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RestorationMode {
    /// Stage the files and load them into the running node.
    #[default]
    Import,
    /// Overlay the files into the live data directory; the caller restarts the node.
    InPlace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOperationRequest {
    #[serde(flatten)]
    pub base: BaseOperationRequest,
    /// Exact snapshot to restore; there is no default.
    #[serde(default)]
    pub snapshot_tag: String,
    #[serde(default)]
    pub entities: DatabaseEntities,
    /// Node receiving the data. Unset means the node that took the backup, which is
    /// the node named by the storage location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub restoration_mode: RestorationMode,
    #[serde(default)]
    pub restore_schema: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default)]
    pub global_request: bool,
}

impl RestoreOperationRequest {
    pub fn new(base: BaseOperationRequest, snapshot_tag: impl Into<String>) -> Self {
        RestoreOperationRequest {
            base,
            snapshot_tag: snapshot_tag.into(),
            entities: DatabaseEntities::all(),
            target_node_id: None,
            restoration_mode: RestorationMode::Import,
            restore_schema: false,
            dc: None,
            timeout: default_timeout(),
            global_request: false,
        }
    }

    /// Node that produced the backup.
    pub fn source_node_id(&self) -> Option<&str> {
        self.base.storage_location.node_id.as_deref()
    }

    /// Node the data is restored onto.
    pub fn target_node_id(&self) -> Option<&str> {
        self.target_node_id.as_deref().or_else(|| self.source_node_id())
    }

    pub fn is_same_node(&self) -> bool {
        match (self.source_node_id(), self.target_node_id()) {
            (Some(source), Some(target)) => source == target,
            _ => false,
        }
    }

    pub fn validate(
        mut self,
        env: &ValidationEnvironment<'_>,
    ) -> Result<Validated<RestoreOperationRequest>, BackupError> {
        self.base.validate(env)?;

        validate_snapshot_tag(&self.snapshot_tag)?;
        self.entities.validate()?;
        self.timeout = effective_timeout(self.timeout);

        if let Some(target) = &self.target_node_id {
            if target.trim().is_empty() {
                return Err(BackupError::InvalidRequest(
                    "targetNodeId must not be empty when set".to_string(),
                ));
            }
        }

        if !self.global_request {
            // A single-node restore has to know which node's backup to read.
            self.base.storage_location.require_node()?;
        } else if self.target_node_id.is_some() {
            return Err(BackupError::InvalidRequest(
                "targetNodeId cannot be combined with a global restore".to_string(),
            ));
        }

        Ok(Validated(self))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    fn validate(value: serde_json::Value) -> Result<Validated<RestoreOperationRequest>, BackupError> {
        let request: RestoreOperationRequest = serde_json::from_value(value).unwrap();
        let providers = all_providers();
        let secrets = StaticSecrets::unmanaged();
        request.validate(&ValidationEnvironment {
            supported_providers: &providers,
            secrets: &secrets,
        })
    }

    #[test]
    fn snapshot_tag_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(json!({
            "storageLocation": "s3://b/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
        }))
        .unwrap_err();
        assert!(err.to_string().contains("snapshotTag"));
    }

    #[test]
    fn target_defaults_to_source_node() {
        let dir = tempfile::tempdir().unwrap();
        let request = validate(json!({
            "storageLocation": "file:///backups/b/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
        }))
        .unwrap();
        assert_eq!(request.target_node_id(), Some("n1"));
        assert!(request.is_same_node());
        assert_eq!(request.restoration_mode, RestorationMode::Import);

        let other = validate(json!({
            "storageLocation": "file:///backups/b/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "targetNodeId": "n2",
            "restorationMode": "inPlace",
        }))
        .unwrap();
        assert!(!other.is_same_node());
        assert_eq!(other.restoration_mode, RestorationMode::InPlace);
    }

    #[test]
    fn global_restore_rejects_explicit_target() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(json!({
            "storageLocation": "s3://b/prod/dc1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "globalRequest": true,
            "targetNodeId": "n2",
        }))
        .unwrap_err();
        assert!(matches!(err, BackupError::InvalidRequest(_)));
    }

    #[test]
    fn timeout_is_coerced() {
        let dir = tempfile::tempdir().unwrap();
        let request = validate(json!({
            "storageLocation": "s3://b/prod/dc1/n1",
            "cassandraDirectory": dir.path(),
            "snapshotTag": "snap",
            "timeout": 0,
        }))
        .unwrap();
        assert_eq!(request.timeout, 5);
    }
}
