use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{
    BaseOperationRequest, DatabaseEntities, Validated, ValidationEnvironment, default_timeout,
    effective_timeout, validate_snapshot_tag,
};
use crate::errors::BackupError;

pub fn default_snapshot_tag() -> String {
    format!("autosnap-{}", Utc::now().timestamp())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOperationRequest {
    #[serde(flatten)]
    pub base: BaseOperationRequest,
    #[serde(default = "default_snapshot_tag")]
    pub snapshot_tag: String,
    #[serde(default)]
    pub entities: DatabaseEntities,
    /// Comma-separated datacenters; only read by the coordinator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,
    /// Hours; only read by the coordinator. Values below 1 mean the default.
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default)]
    pub global_request: bool,
    /// Written by the backup run itself; any value supplied by a caller is dropped.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    schema_version: Option<String>,
    #[serde(default)]
    pub upload_cluster_topology: bool,
}

impl BackupOperationRequest {
    pub fn new(base: BaseOperationRequest) -> Self {
        BackupOperationRequest {
            base,
            snapshot_tag: default_snapshot_tag(),
            entities: DatabaseEntities::all(),
            dc: None,
            timeout: default_timeout(),
            global_request: false,
            schema_version: None,
            upload_cluster_topology: false,
        }
    }

    pub fn schema_version(&self) -> Option<&str> {
        self.schema_version.as_deref()
    }

    pub fn effective_timeout(&self) -> i64 {
        effective_timeout(self.timeout)
    }

    pub fn validate(
        mut self,
        env: &ValidationEnvironment<'_>,
    ) -> Result<Validated<BackupOperationRequest>, BackupError> {
        self.base.validate(env)?;

        if self.snapshot_tag.trim().is_empty() {
            self.snapshot_tag = default_snapshot_tag();
        }
        validate_snapshot_tag(&self.snapshot_tag)?;

        self.entities.validate()?;

        self.timeout = effective_timeout(self.timeout);

        if self.global_request {
            self.upload_cluster_topology = true;
        } else {
            self.base.storage_location.require_node()?;
        }

        self.schema_version = None;
        Ok(Validated(self))
    }
}

impl Validated<BackupOperationRequest> {
    /// Records the schema version observed while taking the snapshot.
    pub(crate) fn record_schema_version(&mut self, version: String) {
        self.0.schema_version = Some(version);
    }
}
